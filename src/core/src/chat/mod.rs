mod controller;
mod view;

pub use controller::ChatController;
pub use view::{DisplayMessage, Surface};

use deskchat_protocol::{UserId, UserRole};

/// Who is using a controller. Injected at construction; nothing in the
/// core reads a global session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub role: UserRole,
}

impl Session {
    pub fn new(user_id: UserId, role: UserRole) -> Self {
        Self { user_id, role }
    }
}
