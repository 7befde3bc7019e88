//! Transport-facing handles for connected clients.

use coedit_proto::ContextId;
use tokio::sync::mpsc;

use crate::error::DeliveryError;

/// Outbound half of a client connection.
///
/// The transport layer owns the receiving end and writes every frame to the
/// client; the engine never sees transport framing. Dropping the receiver
/// marks the context dead.
#[derive(Debug, Clone)]
pub struct ContextSink {
	tx: mpsc::UnboundedSender<String>,
}

impl ContextSink {
	/// Wraps an existing frame sender.
	pub fn from_sender(tx: mpsc::UnboundedSender<String>) -> Self {
		Self { tx }
	}

	/// Creates a sink together with the receiver the transport drains.
	pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	/// Returns true once the transport has dropped its receiver.
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// One connected client within one editing session.
#[derive(Debug, Clone)]
pub struct SessionContext {
	id: ContextId,
	sink: ContextSink,
}

impl SessionContext {
	/// Binds a context id to its outbound sink.
	pub fn new(id: ContextId, sink: ContextSink) -> Self {
		Self { id, sink }
	}

	/// Identifier of this context.
	pub fn id(&self) -> &ContextId {
		&self.id
	}

	/// Queues a text frame for the client.
	///
	/// # Errors
	///
	/// Returns [`DeliveryError`] when the transport is gone. Delivery is never
	/// retried; the caller reaps the context.
	pub fn send(&self, frame: impl Into<String>) -> Result<(), DeliveryError> {
		self.sink.tx.send(frame.into()).map_err(|_| DeliveryError(self.id.clone()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn send_fails_after_receiver_drops() {
		let (sink, rx) = ContextSink::channel();
		let ctx = SessionContext::new(ContextId::new("c1"), sink.clone());

		assert!(ctx.send("hello").is_ok());
		drop(rx);

		assert!(sink.is_closed());
		assert_eq!(ctx.send("again"), Err(DeliveryError(ContextId::new("c1"))));
	}
}
