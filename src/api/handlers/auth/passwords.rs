//! Password policy and Argon2id hashing.

use anyhow::{anyhow, Context, Result};
use argon2::{
    password_hash::{PasswordHasher as _, SaltString},
    Algorithm, Argon2, Params, PasswordHash, PasswordVerifier, Version,
};
use flate2::read::GzDecoder;
use rand::rngs::OsRng;
use regex::Regex;
use std::{collections::HashSet, io::Read, path::Path};

const BUNDLED_COMMON_PASSWORDS: &str = include_str!("common-passwords.txt");
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_SIMILARITY: f64 = 0.7;

/// Validators run in a fixed order and every failure is reported.
#[derive(Clone, Debug)]
pub struct PasswordPolicy {
    min_length: usize,
    common: HashSet<String>,
}

impl PasswordPolicy {
    /// Policy backed by the bundled common-password list.
    #[must_use]
    pub fn new(min_length: usize) -> Self {
        Self {
            min_length,
            common: parse_common_passwords(BUNDLED_COMMON_PASSWORDS),
        }
    }

    /// Replace the common-password list with the one in `path`, one entry
    /// per line. Gzip files (such as Django's `common-passwords.txt.gz`) are
    /// detected by their magic bytes.
    /// # Errors
    /// Returns an error if the file cannot be read or decoded.
    pub fn with_common_passwords_file(mut self, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read common passwords from {}", path.display()))?;
        let text = if bytes.starts_with(&GZIP_MAGIC) {
            let mut text = String::new();
            GzDecoder::new(bytes.as_slice())
                .read_to_string(&mut text)
                .with_context(|| format!("failed to decompress {}", path.display()))?;
            text
        } else {
            String::from_utf8(bytes)
                .with_context(|| format!("{} is not valid UTF-8", path.display()))?
        };
        self.common = parse_common_passwords(&text);
        Ok(self)
    }

    /// Messages for every rule `password` breaks. `attributes` are
    /// `(verbose name, value)` pairs of the account, e.g. `("email address", ..)`.
    #[must_use]
    pub fn validate(&self, password: &str, attributes: &[(&str, &str)]) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(verbose_name) = too_similar(password, attributes) {
            errors.push(format!("The password is too similar to the {verbose_name}."));
        }

        if password.chars().count() < self.min_length {
            let unit = if self.min_length == 1 {
                "character"
            } else {
                "characters"
            };
            errors.push(format!(
                "This password is too short. It must contain at least {} {unit}.",
                self.min_length
            ));
        }

        if self.is_common(password) {
            errors.push("This password is too common.".to_string());
        }

        if !password.is_empty() && password.chars().all(char::is_numeric) {
            errors.push("This password is entirely numeric.".to_string());
        }

        errors
    }

    fn is_common(&self, password: &str) -> bool {
        self.common.contains(&password.trim().to_lowercase())
    }
}

fn parse_common_passwords(text: &str) -> HashSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// First attribute the password resembles, by verbose name.
fn too_similar<'a>(password: &str, attributes: &[(&'a str, &str)]) -> Option<&'a str> {
    let password = password.to_lowercase();
    let splitter = Regex::new(r"\W+").ok()?;

    for (verbose_name, value) in attributes {
        if value.is_empty() {
            continue;
        }
        let value = value.to_lowercase();
        let parts = splitter
            .split(&value)
            .map(str::to_string)
            .chain(std::iter::once(value.clone()));
        for part in parts {
            if exceeds_maximum_length_ratio(&password, &part) {
                continue;
            }
            if quick_ratio(&password, &part) >= MAX_SIMILARITY {
                return Some(*verbose_name);
            }
        }
    }
    None
}

/// A long password cannot be "similar" to a much shorter value.
#[allow(clippy::cast_precision_loss)]
fn exceeds_maximum_length_ratio(password: &str, value: &str) -> bool {
    let password_len = password.chars().count();
    let value_len = value.chars().count();
    let length_bound_similarity = MAX_SIMILARITY / 2.0 * password_len as f64;
    password_len >= 10 * value_len && (value_len as f64) < length_bound_similarity
}

/// Upper bound on sequence similarity: shared characters regardless of
/// order, as `2 * matches / (len(a) + len(b))`.
#[allow(clippy::cast_precision_loss)]
fn quick_ratio(a: &str, b: &str) -> f64 {
    let total = a.chars().count() + b.chars().count();
    if total == 0 {
        return 1.0;
    }
    let mut available = std::collections::HashMap::<char, usize>::new();
    for ch in b.chars() {
        *available.entry(ch).or_default() += 1;
    }
    let mut matches = 0usize;
    for ch in a.chars() {
        if let Some(count) = available.get_mut(&ch) {
            if *count > 0 {
                *count -= 1;
                matches += 1;
            }
        }
    }
    2.0 * matches as f64 / total as f64
}

/// Argon2id hasher. Keeps a throwaway hash to spend equal time on unknown
/// accounts.
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    dummy_hash: String,
}

impl PasswordHasher {
    /// # Errors
    /// Returns an error if hashing the placeholder password fails.
    pub fn new() -> Result<Self> {
        Self::from_argon2(Argon2::default())
    }

    /// # Errors
    /// Returns an error if the cost parameters are out of range.
    pub fn with_cost(memory_kib: u32, iterations: u32) -> Result<Self> {
        let params = Params::new(memory_kib, iterations, 1, None)
            .map_err(|err| anyhow!("invalid Argon2 parameters: {err}"))?;
        Self::from_argon2(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    fn from_argon2(argon2: Argon2<'static>) -> Result<Self> {
        let mut hasher = Self {
            argon2,
            dummy_hash: String::new(),
        };
        hasher.dummy_hash = hasher.hash("innocent-placeholder-password")?;
        Ok(hasher)
    }

    /// PHC string for `password` with a fresh salt.
    /// # Errors
    /// Returns an error if Argon2 fails.
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| anyhow!("failed to hash password: {err}"))?
            .to_string();
        Ok(hash)
    }

    /// Constant-time check; malformed stored hashes never match.
    #[must_use]
    pub fn verify(&self, password: &str, stored_hash: &str) -> bool {
        PasswordHash::new(stored_hash).is_ok_and(|parsed| {
            self.argon2
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
    }

    /// Burn one verification for an account that does not exist.
    pub fn verify_dummy(&self, password: &str) {
        let _ = self.verify(password, &self.dummy_hash);
    }
}
