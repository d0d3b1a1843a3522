use std::collections::BTreeSet;

use crate::{config::Config, domain::UserId};

/// Supplies the admin/owner set used for quota exemption and admin commands.
pub trait RoleProvider: Send + Sync {
    fn is_admin(&self, user_id: UserId) -> bool;
}

impl RoleProvider for Config {
    fn is_admin(&self, user_id: UserId) -> bool {
        Config::is_admin(self, user_id)
    }
}

/// Fixed admin set.
#[derive(Clone, Debug, Default)]
pub struct StaticRoles {
    admins: BTreeSet<UserId>,
}

impl StaticRoles {
    pub fn new(admins: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }
}

impl RoleProvider for StaticRoles {
    fn is_admin(&self, user_id: UserId) -> bool {
        self.admins.contains(&user_id)
    }
}

pub fn is_admin(user_id: Option<UserId>, roles: &dyn RoleProvider) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };
    roles.is_admin(user_id)
}
