//! Account table and the authenticate-or-create policy.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::Serial;

/// Hex MD5 of a password, the form accounts store and compare.
pub fn hash_password(password: &str) -> String {
    hex::encode(Md5::new().chain_update(password).finalize())
}

/// Role bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roles(pub u32);

impl Roles {
    pub const PLAYER: Roles = Roles(0x01);
    pub const COUNSELOR: Roles = Roles(0x02);
    pub const GAME_MASTER: Roles = Roles(0x04);
    pub const ADMINISTRATOR: Roles = Roles(0x08);
    pub const DEVELOPER: Roles = Roles(0x10);
    pub const SUPERUSER: Roles = Roles(0x1F);

    pub fn contains(self, other: Roles) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_superuser(self) -> bool {
        self.contains(Roles::SUPERUSER)
    }

    pub fn is_staff(self) -> bool {
        self.0 & (Roles::COUNSELOR.0 | Roles::GAME_MASTER.0 | Roles::ADMINISTRATOR.0) != 0
    }
}

impl std::ops::BitOr for Roles {
    type Output = Roles;

    fn bitor(self, rhs: Roles) -> Roles {
        Roles(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password_hash: String,
    pub roles: Roles,
    /// Player character, created on first world entry
    #[serde(default)]
    pub player: Option<Serial>,
    /// Unix seconds
    pub created: i64,
    #[serde(default)]
    pub suspended: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("Invalid username")]
    InvalidUsername,

    #[error("Wrong password")]
    WrongPassword,

    #[error("Account suspended")]
    Suspended,
}

impl AccountError {
    /// Reason byte for the login-denied packet.
    pub fn deny_reason(&self) -> u8 {
        match self {
            AccountError::InvalidUsername => 0x00,
            AccountError::WrongPassword => 0x03,
            AccountError::Suspended => 0x02,
        }
    }
}

pub fn is_valid_username(s: &str) -> bool {
    (1..=30).contains(&s.len())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// username -> account, plus the cached superuser.
#[derive(Debug, Default)]
pub struct AccountManager {
    accounts: HashMap<String, Account>,
    superuser: Option<String>,
    /// While set, a login against an empty table creates a superuser.
    /// Cleared as soon as any account exists and never set again.
    provisioning: bool,
}

impl AccountManager {
    /// An empty table for a freshly provisioned world.
    pub fn provisioning(enabled: bool) -> Self {
        Self {
            provisioning: enabled,
            ..Default::default()
        }
    }

    /// Rebuilds the table from saved accounts. Provisioning stays off.
    pub fn from_accounts(accounts: Vec<Account>) -> Self {
        let mut manager = Self::default();
        for account in accounts {
            if account.roles.is_superuser() && manager.superuser.is_none() {
                manager.superuser = Some(account.username.clone());
            }
            manager.accounts.insert(account.username.clone(), account);
        }
        manager
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn is_provisioning(&self) -> bool {
        self.provisioning
    }

    pub fn get(&self, username: &str) -> Option<&Account> {
        self.accounts.get(username)
    }

    pub fn get_mut(&mut self, username: &str) -> Option<&mut Account> {
        self.accounts.get_mut(username)
    }

    pub fn superuser(&self) -> Option<&Account> {
        self.superuser.as_deref().and_then(|u| self.accounts.get(u))
    }

    /// All accounts sorted by username.
    pub fn snapshot(&self) -> Vec<Account> {
        let mut out: Vec<Account> = self.accounts.values().cloned().collect();
        out.sort_by(|a, b| a.username.cmp(&b.username));
        out
    }

    /// Looks the account up and checks the hash, creating a new account on
    /// first sight of a username.
    pub fn authenticate_or_create(
        &mut self,
        username: &str,
        password_hash: &str,
    ) -> Result<&Account, AccountError> {
        if !is_valid_username(username) {
            return Err(AccountError::InvalidUsername);
        }

        if self.accounts.contains_key(username) {
            self.provisioning = false;
            let account = self
                .accounts
                .get(username)
                .ok_or(AccountError::InvalidUsername)?;
            if account.password_hash != password_hash {
                return Err(AccountError::WrongPassword);
            }
            if account.suspended {
                return Err(AccountError::Suspended);
            }
            return Ok(account);
        }

        let roles = if self.provisioning && self.accounts.is_empty() {
            tracing::warn!(
                "[accounts] [provision] username={} granted superuser as first account",
                username
            );
            Roles::SUPERUSER
        } else {
            Roles::PLAYER
        };
        self.provisioning = false;

        if roles.is_superuser() {
            self.superuser = Some(username.to_string());
        }
        tracing::info!("[accounts] [create] username={} roles={:#x}", username, roles.0);

        let account = Account {
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            roles,
            player: None,
            created: chrono::Utc::now().timestamp(),
            suspended: false,
        };
        Ok(self
            .accounts
            .entry(username.to_string())
            .or_insert(account))
    }
}
