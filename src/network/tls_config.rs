/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! TLS client configuration for https feeds
//!
//! - Secure mode: validates certificates against the webpki roots
//! - Insecure mode: skips certificate validation (testing only)
//!
//! Configurations are lazily initialized and shared by all connections.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Once};

lazy_static::lazy_static! {
    /// Certificate-validating client configuration
    static ref SECURE_CONFIG: Arc<ClientConfig> = Arc::new(build_secure_config());

    /// Client configuration without certificate validation
    static ref INSECURE_CONFIG: Arc<ClientConfig> = Arc::new(build_insecure_config());
}

static DEFAULT_PROVIDER: Once = Once::new();

pub fn install_default_provider() {
    DEFAULT_PROVIDER.call_once(|| {
        // Err means another component already installed a provider
        let _ = ring::default_provider().install_default();
    })
}

fn build_secure_config() -> ClientConfig {
    install_default_provider();
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// **WARNING**: Skips all certificate validation.
fn build_insecure_config() -> ClientConfig {
    install_default_provider();
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth()
}

pub(crate) fn client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    if insecure_skip_verify {
        INSECURE_CONFIG.clone()
    } else {
        SECURE_CONFIG.clone()
    }
}

/// Certificate verifier that accepts any certificate
struct NoCertVerification;

impl Debug for NoCertVerification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NoCertVerification")
    }
}

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
