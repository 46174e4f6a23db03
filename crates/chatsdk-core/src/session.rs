use crate::types::User;

/// Identity of one chat session, owned by its state machine.
///
/// Each session carries its own context so several sessions can run side by
/// side in one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    current_user: Option<User>,
    last_connection_id: Option<String>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with a cached identity, for example from a previous run.
    pub fn with_user(user: User) -> Self {
        Self {
            current_user: Some(user),
            last_connection_id: None,
        }
    }

    pub fn current_user(&self) -> Option<&User> {
        self.current_user.as_ref()
    }

    pub fn last_connection_id(&self) -> Option<&str> {
        self.last_connection_id.as_deref()
    }

    pub(crate) fn bind(&mut self, connection_id: String, user: User) {
        self.last_connection_id = Some(connection_id);
        self.current_user = Some(user);
    }

    /// Replace the cached user when `user` is the session's own identity.
    pub(crate) fn refresh_user(&mut self, user: &User) -> bool {
        match &self.current_user {
            Some(current) if current.id == user.id => {
                self.current_user = Some(user.clone());
                true
            }
            _ => false,
        }
    }

    pub(crate) fn clear_connection_id(&mut self) {
        self.last_connection_id = None;
    }
}
