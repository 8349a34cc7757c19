use std::collections::HashMap;

use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::AccountSpec;

const TOKEN_LEN: usize = 32;

/// Index of an account inside [`AccountRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountId(usize);

#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub admin: bool,
    password_digest: [u8; 32],
}

/// Configured accounts plus the session tokens handed out at login.
#[derive(Debug)]
pub struct AccountRegistry {
    accounts: Vec<Account>,
    by_name: HashMap<String, AccountId>,
    sessions: Mutex<HashMap<String, AccountId>>,
}

fn password_digest(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

impl AccountRegistry {
    pub fn new(specs: &[AccountSpec]) -> Self {
        let mut accounts = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::with_capacity(specs.len());
        for spec in specs {
            if by_name.contains_key(&spec.name) {
                continue;
            }
            by_name.insert(spec.name.clone(), AccountId(accounts.len()));
            accounts.push(Account {
                name: spec.name.clone(),
                admin: spec.admin,
                password_digest: password_digest(&spec.password),
            });
        }
        Self {
            accounts,
            by_name,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn account(&self, id: AccountId) -> &Account {
        &self.accounts[id.0]
    }

    pub fn authenticate(&self, name: &str, password: &str) -> Option<AccountId> {
        let id = *self.by_name.get(name)?;
        (self.account(id).password_digest == password_digest(password)).then_some(id)
    }

    pub async fn open_session(&self, id: AccountId) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        self.sessions.lock().await.insert(token.clone(), id);
        token
    }

    pub async fn session(&self, token: &str) -> Option<AccountId> {
        self.sessions.lock().await.get(token).copied()
    }

    pub async fn close_session(&self, token: &str) {
        self.sessions.lock().await.remove(token);
    }
}
