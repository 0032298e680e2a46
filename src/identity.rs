use std::env;

/// Who is voting. Resolved once per session; vote logic dispatches on the variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VoterIdentity {
    Authenticated(String),
    /// No durable id. Only the local cache can tell whether this voter voted.
    Anonymous,
}

impl VoterIdentity {
    pub fn voter_id(&self) -> Option<&str> {
        match self {
            VoterIdentity::Authenticated(id) => Some(id),
            VoterIdentity::Anonymous => None,
        }
    }
}

pub trait IdentityResolver: Send + Sync {
    fn resolve(&self) -> VoterIdentity;
}

/// Reads the durable voter id from `POLLSTREAM_VOTER_ID`.
pub struct EnvIdentityResolver;

pub const VOTER_ID_ENV: &str = "POLLSTREAM_VOTER_ID";

impl IdentityResolver for EnvIdentityResolver {
    fn resolve(&self) -> VoterIdentity {
        match env::var(VOTER_ID_ENV) {
            Ok(id) if !id.trim().is_empty() => VoterIdentity::Authenticated(id.trim().to_string()),
            _ => VoterIdentity::Anonymous,
        }
    }
}
