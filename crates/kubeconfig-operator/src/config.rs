//! Cluster CA discovery
//!
//! Every generated kubeconfig embeds the cluster CA. It comes from, in order:
//! an explicit file, the in-cluster service account CA, or the root
//! certificates of the client configuration.

use std::path::Path;

use anyhow::Context as _;
use tracing::info;

/// CA mounted into every pod with a service account token
pub const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Read a CA file, `None` when it is absent or empty
pub fn read_ca_file(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(data) if data.iter().all(u8::is_ascii_whitespace) => {
            info!(path = %path.display(), "CA file is empty, skipping");
            Ok(None)
        }
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read CA file {}", path.display())),
    }
}

/// PEM-encode DER certificates into one bundle
pub fn pem_encode(certs: &[Vec<u8>]) -> Vec<u8> {
    let blocks: Vec<pem::Pem> = certs
        .iter()
        .map(|der| pem::Pem::new("CERTIFICATE", der.clone()))
        .collect();
    let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
    pem::encode_many_config(&blocks, config).into_bytes()
}

/// Resolve the CA bundle embedded in generated kubeconfigs
///
/// An explicit file that does not exist is an error. No CA from any source
/// is an error.
pub fn load_ca_bundle(
    explicit: Option<&Path>,
    in_cluster: &Path,
    root_certs: Option<&[Vec<u8>]>,
) -> anyhow::Result<Vec<u8>> {
    if let Some(path) = explicit {
        if !path.exists() {
            anyhow::bail!("CA file {} does not exist", path.display());
        }
        if let Some(data) = read_ca_file(path)? {
            info!(path = %path.display(), "Using CA from file");
            return Ok(data);
        }
    }

    if let Some(data) = read_ca_file(in_cluster)? {
        info!(path = %in_cluster.display(), "Using in-cluster CA");
        return Ok(data);
    }

    match root_certs {
        Some(certs) if !certs.is_empty() => {
            info!(count = certs.len(), "Using CA from client configuration");
            Ok(pem_encode(certs))
        }
        _ => anyhow::bail!(
            "no cluster CA found: pass --ca-file or run with a service account or kubeconfig CA"
        ),
    }
}
