// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! Authentication collaborators
//!
//! The handshake only fixes the packet choreography; deciding whether the
//! returned auth bytes are acceptable is delegated to an [`Authenticator`].

use std::collections::HashMap;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use sqlgate_common::Result;

use crate::constants::MYSQL_NATIVE_PASSWORD;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check the client's auth bytes for `plugin` against the connection salt.
    async fn verify(
        &self,
        username: &str,
        auth_response: &[u8],
        plugin: &str,
        salt: &[u8],
    ) -> Result<bool>;
}

/// Accepts every login.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustAuthenticator;

#[async_trait]
impl Authenticator for TrustAuthenticator {
    async fn verify(
        &self,
        _username: &str,
        _auth_response: &[u8],
        _plugin: &str,
        _salt: &[u8],
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Verifies `mysql_native_password` scrambles against plaintext passwords.
#[derive(Debug, Default, Clone)]
pub struct NativePasswordAuthenticator {
    users: HashMap<String, String>,
}

impl NativePasswordAuthenticator {
    pub fn new<I, K, V>(users: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            users: users.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[async_trait]
impl Authenticator for NativePasswordAuthenticator {
    async fn verify(
        &self,
        username: &str,
        auth_response: &[u8],
        plugin: &str,
        salt: &[u8],
    ) -> Result<bool> {
        if plugin != MYSQL_NATIVE_PASSWORD {
            return Ok(false);
        }
        let Some(password) = self.users.get(username) else {
            return Ok(false);
        };

        // Empty password: the client sends no scramble at all
        if password.is_empty() {
            return Ok(auth_response.is_empty());
        }
        Ok(scramble_native_password(password.as_bytes(), salt) == auth_response)
    }
}

/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`
pub fn scramble_native_password(password: &[u8], salt: &[u8]) -> Vec<u8> {
    let hash1 = Sha1::digest(password);
    let hash2 = Sha1::digest(hash1);

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}
