use crate::commander::MgrCommander;
use crate::task::TaskAdmin;
use std::sync::Arc;

/// Entry point for RBD administrative commands served by the manager
#[derive(Clone)]
pub struct RbdAdmin {
    conn: Arc<dyn MgrCommander>,
}

impl RbdAdmin {
    pub fn new(conn: Arc<dyn MgrCommander>) -> Self {
        Self { conn }
    }

    /// Background task management (`rbd task ...`)
    pub fn task(&self) -> TaskAdmin {
        TaskAdmin::new(self.conn.clone())
    }
}
