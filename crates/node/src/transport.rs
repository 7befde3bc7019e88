//! Newline-delimited JSON client transport over TCP.
//!
//! A connection starts with handshake frames tagged by `frame`:
//!
//! * `{"frame":"issueToken","design":..,"user":..,"secret":..}` answers
//!   `{"frame":"token","token":..,"contentVersion":..}`.
//! * `{"frame":"join","design":..,"user":..,"secret":..,"token":..}` answers
//!   `{"frame":"joined","design":..,"context":..,"contentVersion":..}`.
//!
//! The `joined` frame is sent only once the join took effect, so it follows
//! the `join` operations of the local roster. After it, every line is an
//! operation for that design. Errors
//! go back to the offending connection as `{"frame":"error","message":..}`.
//! Closing the connection leaves the session.

use std::io;

use coedit_engine::{ContextSink, Coordinator, EngineError, SessionContext};
use coedit_proto::{ContentVersion, ContextId, DesignId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ClientFrame {
	IssueToken {
		design: DesignId,
		user: String,
		secret: String,
	},
	Join {
		design: DesignId,
		user: String,
		secret: String,
		token: Uuid,
	},
}

#[derive(Debug, Serialize)]
#[serde(tag = "frame", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ServerFrame {
	Token {
		token: Uuid,
		content_version: ContentVersion,
	},
	Joined {
		design: DesignId,
		context: ContextId,
		content_version: ContentVersion,
	},
	Error {
		message: String,
	},
}

#[derive(Debug, Error)]
enum HandshakeError {
	#[error("invalid handshake frame: {0}")]
	Frame(#[from] serde_json::Error),
	#[error(transparent)]
	Engine(#[from] EngineError),
	#[error("connection closed")]
	Closed,
}

/// Accepts connections until `shutdown` fires.
pub async fn serve(listener: TcpListener, coordinator: Coordinator, shutdown: CancellationToken) -> io::Result<()> {
	tracing::info!(addr = %listener.local_addr()?, "client transport listening");

	loop {
		tokio::select! {
			_ = shutdown.cancelled() => {
				tracing::info!("client transport shutting down");
				break;
			}
			res = listener.accept() => {
				match res {
					Ok((stream, peer)) => {
						tracing::debug!(%peer, "client connected");
						tokio::spawn(handle_connection(stream, coordinator.clone(), shutdown.clone()));
					}
					Err(e) => {
						tracing::error!(error = %e, "failed to accept connection");
					}
				}
			}
		}
	}

	Ok(())
}

async fn handle_connection(stream: TcpStream, coordinator: Coordinator, shutdown: CancellationToken) {
	let (read, write) = stream.into_split();
	let (sink, rx) = ContextSink::channel();
	let writer = tokio::spawn(write_frames(write, rx));
	let context = SessionContext::new(ContextId::random(), sink);

	let mut lines = BufReader::new(read).lines();
	let mut joined: Option<DesignId> = None;

	loop {
		let line = tokio::select! {
			_ = shutdown.cancelled() => break,
			line = lines.next_line() => line,
		};
		let line = match line {
			Ok(Some(line)) => line,
			Ok(None) => break,
			Err(e) => {
				tracing::debug!(context = %context.id(), error = %e, "read failed");
				break;
			}
		};
		if line.trim().is_empty() {
			continue;
		}

		let result = if let Some(design) = &joined {
			coordinator
				.submit_operation(design, context.id(), &line)
				.await
				.map_err(HandshakeError::from)
		} else {
			handshake(&coordinator, &context, &line).await.map(|design| joined = design)
		};

		if let Err(err) = result {
			let frame = ServerFrame::Error {
				message: err.to_string(),
			};
			if reply(&context, &frame).is_err() {
				break;
			}
		}
	}

	if let Some(design) = joined
		&& let Err(err) = coordinator.leave(&design, context.id()).await
	{
		tracing::debug!(context = %context.id(), error = %err, "leave on disconnect");
	}
	writer.abort();
}

/// Handles one pre-join frame. Returns the design once joined.
async fn handshake(
	coordinator: &Coordinator,
	context: &SessionContext,
	line: &str,
) -> Result<Option<DesignId>, HandshakeError> {
	match serde_json::from_str::<ClientFrame>(line)? {
		ClientFrame::IssueToken { design, user, secret } => {
			let content_version = coordinator.latest_version(&design).await?;
			let token = coordinator.create_session_token(&design, &user, &secret, content_version);
			reply(context, &ServerFrame::Token { token, content_version })?;
			Ok(None)
		}
		ClientFrame::Join {
			design,
			user,
			secret,
			token,
		} => {
			let content_version = coordinator.validate_session_token(token, &design, &user, &secret)?;
			coordinator.join(&design, context.clone(), &user).await?;
			let joined = ServerFrame::Joined {
				design: design.clone(),
				context: context.id().clone(),
				content_version,
			};
			if let Err(err) = reply(context, &joined) {
				if let Err(leave) = coordinator.leave(&design, context.id()).await {
					tracing::debug!(context = %context.id(), error = %leave, "leave after failed join reply");
				}
				return Err(err);
			}
			Ok(Some(design))
		}
	}
}

fn reply(context: &SessionContext, frame: &ServerFrame) -> Result<(), HandshakeError> {
	let text = serde_json::to_string(frame)?;
	context.send(text).map_err(|_| HandshakeError::Closed)
}

async fn write_frames(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
	while let Some(frame) = rx.recv().await {
		let mut bytes = frame.into_bytes();
		bytes.push(b'\n');
		if let Err(e) = write.write_all(&bytes).await {
			tracing::debug!(error = %e, "client write failed");
			return;
		}
	}
}
