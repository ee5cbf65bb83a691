//! File-backed user registry (`data/users.db`).
//!
//! One line per user: `id|username|salt|hash|email|active`. Not a
//! cryptographically sound credential store — see the hashing note on
//! [`hash_password`] — the contract is "don't store plaintext", nothing
//! stronger.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::fileutil::{append_record, read_records};

const FIELD_COUNT: usize = 6;

#[derive(Debug)]
pub enum AccountError {
    Invalid(&'static str),
    Exists,
    NotFound,
    BadPassword,
    Inactive,
    Io(std::io::Error),
}

impl fmt::Display for AccountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountError::Invalid(why) => write!(f, "invalid field: {why}"),
            AccountError::Exists => write!(f, "username already exists"),
            AccountError::NotFound => write!(f, "user not found"),
            AccountError::BadPassword => write!(f, "incorrect password"),
            AccountError::Inactive => write!(f, "account disabled"),
            AccountError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for AccountError {}

impl From<std::io::Error> for AccountError {
    fn from(e: std::io::Error) -> Self {
        AccountError::Io(e)
    }
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: u64,
    pub username: String,
    pub salt: String,
    pub hash: String,
    pub email: String,
    pub active: bool,
}

struct Inner {
    path: PathBuf,
    rng: StdRng,
}

/// Registers, authenticates, and looks up users backed by a single
/// mutex-serialized text file.
pub struct AccountStore {
    inner: Mutex<Inner>,
}

impl AccountStore {
    pub fn new(data_dir: &Path) -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            ^ (std::process::id() as u64);
        Self {
            inner: Mutex::new(Inner {
                path: data_dir.join("users.db"),
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    fn load(path: &Path) -> Result<Vec<UserRecord>, AccountError> {
        let records = read_records(path, FIELD_COUNT)?;
        Ok(records
            .into_iter()
            .filter_map(|f| parse_record(&f))
            .collect())
    }

    pub fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<u64, AccountError> {
        validate_username(username)?;
        validate_email(email)?;
        if password.is_empty() {
            return Err(AccountError::Invalid("password must not be empty"));
        }

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let users = Self::load(&inner.path)?;
        if users.iter().any(|u| u.username == username) {
            return Err(AccountError::Exists);
        }
        let next_id = users.iter().map(|u| u.id).max().unwrap_or(0) + 1;
        let salt = gen_salt(&mut inner.rng);
        let hash = hash_password(&salt, password);
        append_record(
            &inner.path,
            &[
                &next_id.to_string(),
                username,
                &salt,
                &hash,
                email,
                "1",
            ],
        )?;
        Ok(next_id)
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<u64, AccountError> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let users = Self::load(&inner.path)?;
        let user = users
            .iter()
            .find(|u| u.username == username)
            .ok_or(AccountError::NotFound)?;
        if hash_password(&user.salt, password) != user.hash {
            return Err(AccountError::BadPassword);
        }
        if !user.active {
            return Err(AccountError::Inactive);
        }
        Ok(user.id)
    }

    pub fn get_user_id(&self, username: &str) -> Option<u64> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Self::load(&inner.path)
            .ok()?
            .into_iter()
            .find(|u| u.username == username)
            .map(|u| u.id)
    }

    pub fn get_username(&self, user_id: u64) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Self::load(&inner.path)
            .ok()?
            .into_iter()
            .find(|u| u.id == user_id)
            .map(|u| u.username)
    }

    pub fn exists(&self, username: &str) -> bool {
        self.get_user_id(username).is_some()
    }
}

fn parse_record(fields: &[String]) -> Option<UserRecord> {
    Some(UserRecord {
        id: fields[0].parse().ok()?,
        username: fields[1].clone(),
        salt: fields[2].clone(),
        hash: fields[3].clone(),
        email: fields[4].clone(),
        active: fields[5] == "1",
    })
}

fn validate_username(username: &str) -> Result<(), AccountError> {
    if username.len() < 3 || username.len() > 32 {
        return Err(AccountError::Invalid("username length must be 3-32"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AccountError::Invalid(
            "username must be [A-Za-z0-9_] only",
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), AccountError> {
    if email.len() < 5 || email.len() > 96 {
        return Err(AccountError::Invalid("email length must be 5-96"));
    }
    if email.contains(' ') {
        return Err(AccountError::Invalid("email must not contain spaces"));
    }
    let at = email.find('@').ok_or(AccountError::Invalid("email must contain @"))?;
    let rest = &email[at + 1..];
    if !rest.contains('.') {
        return Err(AccountError::Invalid("email must have a . after @"));
    }
    Ok(())
}

fn gen_salt(rng: &mut StdRng) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    (0..16)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Non-cryptographic: an FNV-1a 64-bit mix of `salt:password`, rendered as
/// 16 lowercase hex digits. Explicitly not resistant to offline attack — see
/// the module doc comment.
fn hash_password(salt: &str, password: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in salt.as_bytes().iter().chain(b":").chain(password.as_bytes()) {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}
