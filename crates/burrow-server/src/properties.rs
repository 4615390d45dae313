//! Process-wide property store backing SERVER_GET_PROP.
//!
//! Seeded with runtime facts at first use; the embedding host can publish
//! additional entries with [`set_property`] before accepting tunnels.

use std::collections::BTreeMap;
use std::sync::{OnceLock, RwLock};

static PROPERTIES: OnceLock<RwLock<BTreeMap<String, String>>> = OnceLock::new();

fn store() -> &'static RwLock<BTreeMap<String, String>> {
    PROPERTIES.get_or_init(|| {
        let mut seeded = BTreeMap::new();
        seeded.insert("os.name".to_string(), std::env::consts::OS.to_string());
        seeded.insert("os.arch".to_string(), std::env::consts::ARCH.to_string());
        seeded.insert("process.pid".to_string(), std::process::id().to_string());
        if let Ok(current_dir) = std::env::current_dir() {
            seeded.insert(
                "process.dir".to_string(),
                current_dir.to_string_lossy().into_owned(),
            );
        }
        if let Ok(exe) = std::env::current_exe() {
            seeded.insert("process.exe".to_string(), exe.to_string_lossy().into_owned());
        }
        RwLock::new(seeded)
    })
}

pub fn set_property(key: impl Into<String>, value: impl Into<String>) {
    store()
        .write()
        .expect("property store lock poisoned")
        .insert(key.into(), value.into());
}

pub fn snapshot() -> BTreeMap<String, String> {
    store()
        .read()
        .expect("property store lock poisoned")
        .clone()
}
