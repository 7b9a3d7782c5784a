use crate::crypto::{KeyDirs, KEYDIR_ENV};
use crate::device::RemoteEndpoint;
use crate::Result;

/// Remote file service serving images.
pub const VHD_SERVER_ENV: &str = "LIBVHD_ICBINN_VHD_SERVER";
/// Remote file service serving keyfiles.
pub const KEY_SERVER_ENV: &str = "LIBVHD_ICBINN_KEY_SERVER";

/// Environment-derived engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Where keyfiles are searched; `None` means encrypted images cannot be opened.
    pub key_dirs: Option<KeyDirs>,
    pub vhd_server: Option<RemoteEndpoint>,
    pub key_server: Option<RemoteEndpoint>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup. Empty values count as
    /// unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let endpoint = |name: &str| get(name).map(|v| v.trim().parse::<RemoteEndpoint>()).transpose();
        Ok(Self {
            key_dirs: get(KEYDIR_ENV).map(|v| KeyDirs::parse(&v)),
            vhd_server: endpoint(VHD_SERVER_ENV)?,
            key_server: endpoint(KEY_SERVER_ENV)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RemoteTransport;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_is_all_unset() {
        let cfg = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn reads_key_dirs_and_servers() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            (KEYDIR_ENV, "/keys/a,/keys/b"),
            (VHD_SERVER_ENV, "v4v:0"),
            (KEY_SERVER_ENV, "tcp:keys.local:9000"),
        ]))
        .unwrap();
        assert_eq!(cfg.key_dirs.unwrap().dirs().len(), 2);
        assert_eq!(
            cfg.vhd_server.unwrap().transport,
            RemoteTransport::LocalChannel { domain: 0 }
        );
        assert_eq!(cfg.key_server.unwrap().port, 9000);
    }

    #[test]
    fn malformed_endpoint_is_an_error() {
        assert!(EngineConfig::from_lookup(lookup(&[(VHD_SERVER_ENV, "udp:x")])).is_err());
        let cfg = EngineConfig::from_lookup(lookup(&[(VHD_SERVER_ENV, "  ")])).unwrap();
        assert!(cfg.vhd_server.is_none());
    }
}
