#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, OnceLock};

use authority::Config;
use tokens::{KeyManager, SigningKey};

const BITS: usize = 2048;

/// One key per test binary; RSA generation is slow.
pub fn keys() -> Arc<KeyManager> {
    static KEY: OnceLock<SigningKey> = OnceLock::new();
    let key = KEY.get_or_init(|| SigningKey::generate(BITS).unwrap());
    Arc::new(KeyManager::from_key(key.clone(), BITS))
}

pub fn config() -> Config {
    Config::parse(
        r#"
        [policy.rules.filesystem]
        paths = ["/srv/**"]
        operations = ["read", "write"]

        [policy.deny]
        all = ["process"]

        [audit]
        sinks = [{ type = "memory" }]
        "#,
    )
    .unwrap()
}

pub fn config_with_file_sink(path: &Path) -> Config {
    let mut config = config();
    config.audit.sinks = vec![audit::SinkConfig::File {
        path: path.to_path_buf(),
    }];
    config
}
