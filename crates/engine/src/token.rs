//! One-time join credentials.
//!
//! A token binds a design, a user and a caller-provided secret to the content
//! version the client was shown when it asked to join. Redeeming the token
//! removes it in the same critical section that looks it up, so two
//! concurrent validations of one token can never both succeed.

use std::collections::HashMap;
use std::time::Duration;

use coedit_proto::{ContentVersion, DesignId};
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{InvalidSessionToken, TokenRejection};

#[derive(Debug)]
struct TokenBinding {
	design_id: DesignId,
	user: String,
	secret: String,
	content_version: ContentVersion,
	issued_at: Instant,
}

impl TokenBinding {
	fn matches(&self, design_id: &DesignId, user: &str, secret: &str) -> bool {
		self.design_id == *design_id && self.user == user && self.secret == secret
	}
}

/// In-memory issuer of single-use session tokens.
///
/// Tokens are scoped to the process lifetime. Expired entries are swept
/// whenever a new token is issued.
#[derive(Debug)]
pub struct SessionTokenIssuer {
	ttl: Duration,
	tokens: Mutex<HashMap<Uuid, TokenBinding>>,
}

impl SessionTokenIssuer {
	/// Creates an issuer whose tokens stay redeemable for `ttl`.
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			tokens: Mutex::new(HashMap::new()),
		}
	}

	/// Mints a token for the given binding.
	pub fn issue(&self, design_id: DesignId, user: &str, secret: &str, content_version: ContentVersion) -> Uuid {
		let token = Uuid::new_v4();
		let now = Instant::now();

		let mut tokens = self.tokens.lock();
		let before = tokens.len();
		tokens.retain(|_, binding| now.duration_since(binding.issued_at) < self.ttl);
		let swept = before - tokens.len();
		if swept > 0 {
			tracing::debug!(swept, "expired session tokens dropped");
		}

		tokens.insert(
			token,
			TokenBinding {
				design_id,
				user: user.to_string(),
				secret: secret.to_string(),
				content_version,
				issued_at: now,
			},
		);
		token
	}

	/// Redeems a token and returns the content version it was issued for.
	///
	/// The token is consumed whether or not validation succeeds.
	///
	/// # Errors
	///
	/// Returns [`InvalidSessionToken`] when the token is unknown, already
	/// consumed, expired, or bound to a different design, user or secret.
	pub fn validate(
		&self,
		token: Uuid,
		design_id: &DesignId,
		user: &str,
		secret: &str,
	) -> Result<ContentVersion, InvalidSessionToken> {
		let binding = self.tokens.lock().remove(&token);
		let Some(binding) = binding else {
			return Err(InvalidSessionToken(TokenRejection::Unknown));
		};

		if !binding.matches(design_id, user, secret) {
			tracing::debug!(design = %design_id, "session token binding mismatch");
			return Err(InvalidSessionToken(TokenRejection::Mismatch));
		}
		if binding.issued_at.elapsed() >= self.ttl {
			return Err(InvalidSessionToken(TokenRejection::Expired));
		}

		Ok(binding.content_version)
	}

	/// Number of outstanding tokens, expired ones included until swept.
	pub fn outstanding(&self) -> usize {
		self.tokens.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn issuer() -> SessionTokenIssuer {
		SessionTokenIssuer::new(Duration::from_secs(60))
	}

	#[test]
	fn token_redeems_exactly_once() {
		let issuer = issuer();
		let design = DesignId::new("d1");
		let token = issuer.issue(design.clone(), "ada", "s3cret", ContentVersion(7));

		assert_eq!(issuer.validate(token, &design, "ada", "s3cret"), Ok(ContentVersion(7)));
		assert_eq!(
			issuer.validate(token, &design, "ada", "s3cret"),
			Err(InvalidSessionToken(TokenRejection::Unknown))
		);
	}

	#[test]
	fn never_issued_token_is_unknown() {
		let issuer = issuer();
		let err = issuer.validate(Uuid::new_v4(), &DesignId::new("d1"), "ada", "x").unwrap_err();
		assert_eq!(err.0, TokenRejection::Unknown);
	}

	#[test]
	fn mismatched_binding_fails_and_consumes_the_token() {
		let issuer = issuer();
		let design = DesignId::new("d1");

		for (d, u, s) in [("d2", "ada", "s"), ("d1", "bob", "s"), ("d1", "ada", "wrong")] {
			let token = issuer.issue(design.clone(), "ada", "s", ContentVersion(1));
			let err = issuer.validate(token, &DesignId::new(d), u, s).unwrap_err();
			assert_eq!(err.0, TokenRejection::Mismatch);
			assert_eq!(
				issuer.validate(token, &design, "ada", "s").unwrap_err().0,
				TokenRejection::Unknown
			);
		}
		assert_eq!(issuer.outstanding(), 0);
	}

	#[test]
	fn tokens_are_distinct() {
		let issuer = issuer();
		let design = DesignId::new("d1");
		let a = issuer.issue(design.clone(), "ada", "s", ContentVersion(0));
		let b = issuer.issue(design, "ada", "s", ContentVersion(0));
		assert_ne!(a, b);
		assert_eq!(issuer.outstanding(), 2);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn expired_tokens_are_rejected_and_swept() {
		let issuer = SessionTokenIssuer::new(Duration::from_secs(5));
		let design = DesignId::new("d1");
		let stale = issuer.issue(design.clone(), "ada", "s", ContentVersion(2));

		tokio::time::advance(Duration::from_secs(6)).await;

		let fresh = issuer.issue(design.clone(), "ada", "s", ContentVersion(3));
		assert_eq!(issuer.outstanding(), 1);
		assert_eq!(issuer.validate(stale, &design, "ada", "s").unwrap_err().0, TokenRejection::Unknown);
		assert_eq!(issuer.validate(fresh, &design, "ada", "s"), Ok(ContentVersion(3)));

		let late = issuer.issue(design.clone(), "ada", "s", ContentVersion(4));
		tokio::time::advance(Duration::from_secs(5)).await;
		assert_eq!(issuer.validate(late, &design, "ada", "s").unwrap_err().0, TokenRejection::Expired);
	}
}
