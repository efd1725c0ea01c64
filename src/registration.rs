//! Registration and check-in seam.
//!
//! Obtaining credentials is an HTTPS affair against the registration
//! services, entirely separate from the persistent MCS stream this crate
//! maintains. The client therefore only defines the contract: a
//! [`Registrar`] validates existing credentials at startup and mints fresh
//! ones when validation fails or nothing is stored yet.

use std::future::Future;
use std::pin::Pin;

use crate::credentials::Credentials;
use crate::error::Result;

/// Issues and validates device credentials.
///
/// Methods return boxed futures so implementations stay object safe and the
/// client can hold a `dyn Registrar`.
pub trait Registrar: Send + Sync {
    /// Check an existing bundle in with the registration service.
    ///
    /// `Ok(true)` means the credentials are still valid; `Ok(false)` means
    /// the service rejected them and a fresh registration is needed. `Err`
    /// is reserved for transport-level failures talking to the service.
    fn check_in<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Register this device for `sender_id`, returning a fresh bundle.
    fn register<'a>(
        &'a self,
        sender_id: u64,
        app_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Credentials>> + Send + 'a>>;
}
