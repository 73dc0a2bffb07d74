//! Client TLS for node channels. The fleet runs on one shared self-signed
//! CA whose certificates carry no hostnames, so with
//! `insecure_skip_verify` (the default) the verifier accepts any server
//! certificate; trust comes from the CA-signed client identity both sides
//! require. The knob exists for fleets that do provision real SANs.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::Context;
use rustls::ClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::MtlsConfig;

pub fn client_config(mtls: &MtlsConfig) -> anyhow::Result<ClientConfig> {
	let provider = provider();

	let ca = std::fs::read(&mtls.ca_cert)
		.with_context(|| format!("read ca cert {}", mtls.ca_cert.display()))?;
	let mut roots = RootCertStore::empty();
	let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(Cursor::new(ca)))
		.collect::<Result<Vec<_>, _>>()?;
	roots.add_parsable_certificates(certs);

	let cert =
		std::fs::read(&mtls.cert).with_context(|| format!("read cert {}", mtls.cert.display()))?;
	let cert_chain = rustls_pemfile::certs(&mut std::io::BufReader::new(Cursor::new(cert)))
		.collect::<Result<Vec<_>, _>>()?;
	let key = std::fs::read(&mtls.key).with_context(|| format!("read key {}", mtls.key.display()))?;
	let private_key = rustls_pemfile::private_key(&mut std::io::BufReader::new(Cursor::new(key)))?
		.context("no private key found")?;

	let mut config = ClientConfig::builder_with_provider(provider.clone())
		.with_safe_default_protocol_versions()
		.expect("client config must be valid")
		.with_root_certificates(roots)
		.with_client_auth_cert(cert_chain, private_key)?;
	if mtls.insecure_skip_verify {
		config
			.dangerous()
			.set_certificate_verifier(Arc::new(NoVerifier(provider)));
	}
	config.alpn_protocols = vec![b"h2".to_vec()];
	Ok(config)
}

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

/// Accepts any server certificate. The fleet's shared self-signed CA has
/// no hostnames, so SAN verification cannot succeed.
#[derive(Debug)]
pub struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.0.signature_verification_algorithms.supported_schemes()
	}
}
