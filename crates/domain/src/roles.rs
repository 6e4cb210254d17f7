//! Member roles and the single hierarchy table every permission or display
//! decision is answered from.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Root,
    Admin,
    ProductionManager,
    TokenDesigner,
    CustomerSupportManager,
    User,
    Inactive,
    Suspended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    CompanyCreate,
    MemberInvite,
    UserManage,
    ProductionManage,
    TokenManage,
    CustomerSupportManage,
    WalletManage,
    FinancialAccess,
    AllPermissions,
}

#[derive(Debug)]
pub struct RoleProfile {
    pub role: Role,
    pub level: u8,
    pub display_name: &'static str,
    pub description: &'static str,
    pub permissions: &'static [Permission],
}

const ROLE_TABLE: [RoleProfile; 8] = [
    RoleProfile {
        role: Role::Root,
        level: 100,
        display_name: "Root administrator",
        description: "Top-level administrator holding every permission",
        permissions: &[
            Permission::CompanyCreate,
            Permission::MemberInvite,
            Permission::UserManage,
            Permission::ProductionManage,
            Permission::TokenManage,
            Permission::CustomerSupportManage,
            Permission::WalletManage,
            Permission::FinancialAccess,
            Permission::AllPermissions,
        ],
    },
    RoleProfile {
        role: Role::Admin,
        level: 80,
        display_name: "Brand administrator",
        description: "Administers brands and invites members",
        permissions: &[
            Permission::CompanyCreate,
            Permission::MemberInvite,
            Permission::ProductionManage,
            Permission::TokenManage,
            Permission::CustomerSupportManage,
            Permission::WalletManage,
            Permission::FinancialAccess,
        ],
    },
    RoleProfile {
        role: Role::ProductionManager,
        level: 60,
        display_name: "Production manager",
        description: "Plans and manages production",
        permissions: &[Permission::ProductionManage, Permission::FinancialAccess],
    },
    RoleProfile {
        role: Role::TokenDesigner,
        level: 60,
        display_name: "Token designer",
        description: "Designs tokens and manages wallets",
        permissions: &[
            Permission::TokenManage,
            Permission::WalletManage,
            Permission::FinancialAccess,
        ],
    },
    RoleProfile {
        role: Role::CustomerSupportManager,
        level: 60,
        display_name: "Customer support manager",
        description: "Manages customer support",
        permissions: &[Permission::CustomerSupportManage],
    },
    RoleProfile {
        role: Role::User,
        level: 40,
        display_name: "User",
        description: "Regular member",
        permissions: &[Permission::CompanyCreate],
    },
    RoleProfile {
        role: Role::Inactive,
        level: 10,
        display_name: "Inactive",
        description: "Member without access",
        permissions: &[],
    },
    RoleProfile {
        role: Role::Suspended,
        level: 0,
        display_name: "Suspended",
        description: "Member whose access has been suspended",
        permissions: &[],
    },
];

impl Role {
    pub const ALL: [Role; 8] = [
        Role::Root,
        Role::Admin,
        Role::ProductionManager,
        Role::TokenDesigner,
        Role::CustomerSupportManager,
        Role::User,
        Role::Inactive,
        Role::Suspended,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Admin => "admin",
            Role::ProductionManager => "production_manager",
            Role::TokenDesigner => "token_designer",
            Role::CustomerSupportManager => "customer_support_manager",
            Role::User => "user",
            Role::Inactive => "inactive",
            Role::Suspended => "suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }

    pub fn profile(&self) -> &'static RoleProfile {
        // The table is declared in enum order.
        &ROLE_TABLE[*self as usize]
    }

    pub fn level(&self) -> u8 {
        self.profile().level
    }

    pub fn display_name(&self) -> &'static str {
        self.profile().display_name
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        let permissions = self.profile().permissions;
        permissions.contains(&permission) || permissions.contains(&Permission::AllPermissions)
    }

    pub fn can_invite(&self) -> bool {
        self.has_permission(Permission::MemberInvite)
    }

    pub fn can_manage_members(&self) -> bool {
        self.has_permission(Permission::UserManage)
    }

    pub fn outranks(&self, other: Role) -> bool {
        self.level() > other.level()
    }
}

impl FromStr for Role {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == value)
            .ok_or("unknown role")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_in_enum_order() {
        for role in Role::ALL {
            assert_eq!(role.profile().role, role);
        }
    }

    #[test]
    fn only_root_and_admin_may_invite() {
        let inviters: Vec<_> = Role::ALL.into_iter().filter(Role::can_invite).collect();
        assert_eq!(inviters, vec![Role::Root, Role::Admin]);
    }

    #[test]
    fn all_permissions_implies_every_permission() {
        assert!(Role::Root.has_permission(Permission::CustomerSupportManage));
        assert!(Role::Root.can_manage_members());
        assert!(!Role::Admin.can_manage_members());
        assert!(!Role::Suspended.has_permission(Permission::CompanyCreate));
    }

    #[test]
    fn levels_follow_hierarchy() {
        assert!(Role::Root.outranks(Role::Admin));
        assert!(Role::Admin.outranks(Role::TokenDesigner));
        assert!(!Role::TokenDesigner.outranks(Role::ProductionManager));
        assert_eq!(Role::Suspended.level(), 0);
    }

    #[test]
    fn parses_snake_case_names() {
        assert_eq!(Role::parse("customer_support_manager"), Some(Role::CustomerSupportManager));
        assert_eq!(Role::parse("owner"), None);
    }
}
