//! Current-actor session management.
//!
//! The client owns exactly one [`SessionManager`]. The current session can
//! only be replaced through [`SessionManager::become_user`] and cleared
//! through [`SessionManager::log_out`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use eaves_common::{Error, LocalId, Result};
use eaves_storage::{RemoteStore, SessionInfo};

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub session_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| t <= Utc::now())
    }
}

impl From<SessionInfo> for Session {
    fn from(info: SessionInfo) -> Self {
        Self {
            user_id: info.user_id,
            session_token: info.session_token,
            expires_at: info.expires_at,
        }
    }
}

/// Who is acting locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// No session and no automatic user.
    Anonymous,
    /// Automatic user created locally; it has no remote identity yet.
    Automatic(LocalId),
    /// Authenticated user.
    User(Session),
}

impl Actor {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Actor::User(session) => Some(&session.user_id),
            _ => None,
        }
    }

    pub fn session_token(&self) -> Option<&str> {
        match self {
            Actor::User(session) => Some(&session.session_token),
            _ => None,
        }
    }
}

#[derive(Default)]
struct State {
    current: Option<Session>,
    automatic_enabled: bool,
    automatic: Option<LocalId>,
}

/// Holder of the current session.
pub struct SessionManager {
    state: RwLock<State>,
    /// Where the session is persisted, if anywhere.
    path: Option<PathBuf>,
}

impl SessionManager {
    /// Create a manager that keeps the session in memory only.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(State::default()),
            path: None,
        }
    }

    /// Open a manager persisting to `path`, loading any stored session.
    ///
    /// # Errors
    /// - Unreadable or corrupt session file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let current = if path.exists() {
            let content = fs::read_to_string(&path).await.map_err(Error::Io)?;
            let session: Session = serde_json::from_str(&content)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            debug!("Loaded session for user {}", session.user_id);
            Some(session)
        } else {
            None
        };
        Ok(Self {
            state: RwLock::new(State {
                current,
                ..State::default()
            }),
            path: Some(path),
        })
    }

    /// The current session, if any.
    pub fn current(&self) -> Option<Session> {
        self.state.read().current.clone()
    }

    pub fn current_token(&self) -> Option<String> {
        self.state
            .read()
            .current
            .as_ref()
            .map(|s| s.session_token.clone())
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.state.read().current.as_ref().map(|s| s.user_id.clone())
    }

    /// Who is acting now.
    ///
    /// With automatic users enabled and no session, an automatic user is
    /// created on first use and kept until log-out.
    pub fn current_actor(&self) -> Actor {
        let mut state = self.state.write();
        if let Some(session) = &state.current {
            return Actor::User(session.clone());
        }
        if state.automatic_enabled {
            let id = *state.automatic.get_or_insert_with(LocalId::new);
            return Actor::Automatic(id);
        }
        Actor::Anonymous
    }

    /// Create automatic users when nobody is logged in.
    pub fn enable_automatic_user(&self) {
        self.state.write().automatic_enabled = true;
    }

    /// Make the owner of `token` the current actor.
    ///
    /// # Postconditions
    /// - On success the new session is current and persisted
    /// - On failure the previous session is unchanged
    ///
    /// # Errors
    /// - `Unauthorized` if the remote rejects the token or it has expired
    /// - Network errors
    /// - Persistence failure
    pub async fn become_user(&self, remote: &dyn RemoteStore, token: &str) -> Result<Session> {
        if token.is_empty() {
            return Err(Error::InvalidInput("Session token must not be empty".to_string()));
        }
        let session = Session::from(remote.validate_session(token).await?);
        if session.is_expired() {
            return Err(Error::Unauthorized(format!(
                "Session for user {} has expired",
                session.user_id
            )));
        }

        self.persist(Some(&session)).await?;
        {
            let mut state = self.state.write();
            state.current = Some(session.clone());
            state.automatic = None;
        }
        info!("Became user {}", session.user_id);
        Ok(session)
    }

    /// Clear the current session.
    ///
    /// Deletes the persisted session, drops any automatic user, and revokes
    /// the token remotely on a best-effort basis.
    pub async fn log_out(&self, remote: &dyn RemoteStore) -> Result<()> {
        let previous = {
            let mut state = self.state.write();
            state.automatic = None;
            state.current.take()
        };
        self.persist(None).await?;

        if let Some(session) = previous {
            if let Err(e) = remote.revoke_session(&session.session_token).await {
                warn!("Failed to revoke session for {}: {}", session.user_id, e);
            }
            info!("Logged out user {}", session.user_id);
        }
        Ok(())
    }

    async fn persist(&self, session: Option<&Session>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        match session {
            Some(session) => {
                let json = serde_json::to_string_pretty(session)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                let tmp = path.with_extension("tmp");
                fs::write(&tmp, json).await.map_err(Error::Io)?;
                fs::rename(&tmp, path).await.map_err(Error::Io)
            }
            None => match fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Io(e)),
            },
        }
    }
}
