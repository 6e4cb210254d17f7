use serde::{Deserialize, Serialize};

use crate::roles::Role;

/// Who is performing a privileged operation. Passed explicitly into every
/// operation instead of being read from a signed-in session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InviterContext {
    pub member_id: String,
    pub role: Role,
}

impl InviterContext {
    pub fn new(member_id: impl Into<String>, role: Role) -> Self {
        Self {
            member_id: member_id.into(),
            role,
        }
    }
}
