//! Stable per-host sensor identifier.
//!
//! Resolved once at startup and reused for every event the agent emits.
//! The identifier survives reinstalls through `device_id.txt` in the data
//! directory; the environment override exists for fleet tooling that
//! assigns identities centrally.

use std::fmt;
use std::fs;

use camino::Utf8Path;
use uuid::Uuid;

/// Where the sensor id came from, for diagnostics.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SensorIdSource {
    Env,
    DeviceIdFile,
    GeneratedFallback,
    GeneratedNew,
    GeneratedMemoryOnly,
}

impl SensorIdSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorIdSource::Env => "env",
            SensorIdSource::DeviceIdFile => "device_id_file",
            SensorIdSource::GeneratedFallback => "generated_fallback",
            SensorIdSource::GeneratedNew => "generated_new",
            SensorIdSource::GeneratedMemoryOnly => "generated_memory_only",
        }
    }
}

impl fmt::Display for SensorIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SensorId {
    value: String,
    source: SensorIdSource,
}

impl SensorId {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> SensorIdSource {
        self.source
    }
}

/// Resolves the sensor id.
///
/// Order: the `SENSOR_ID_OVERRIDE` environment value when non-empty, then
/// the persisted `device_id.txt`, then a freshly generated id which is
/// persisted on a best-effort basis. Never fails; the worst outcome is a
/// memory-only id that changes on restart.
pub fn resolve(device_id_file: &Utf8Path, env_override: Option<&str>) -> SensorId {
    if let Some(id_override) = env_override.map(str::trim).filter(|value| !value.is_empty()) {
        return SensorId {
            value: id_override.to_owned(),
            source: SensorIdSource::Env,
        };
    }

    if device_id_file.exists() {
        match fs::read_to_string(device_id_file) {
            Ok(contents) if !contents.trim().is_empty() => {
                return SensorId {
                    value: contents.trim().to_owned(),
                    source: SensorIdSource::DeviceIdFile,
                };
            }
            Ok(_) | Err(_) => {
                warn!(path = %device_id_file, "Device id file is unreadable or empty; generating a volatile id");
                return SensorId {
                    value: generate(),
                    source: SensorIdSource::GeneratedFallback,
                };
            }
        }
    }

    let value = generate();

    let source = match fs::write(device_id_file, &value) {
        Ok(()) => SensorIdSource::GeneratedNew,
        Err(error) => {
            warn!(%error, path = %device_id_file, "Couldn’t persist the generated device id");
            SensorIdSource::GeneratedMemoryOnly
        }
    };

    SensorId { value, source }
}

/// 32 lowercase hex chars, no hyphens.
fn generate() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn device_id_path(tmp_dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from(tmp_dir.path().to_str().expect("utf-8 temp path")).join("device_id.txt")
    }

    #[test]
    fn env_override_wins_over_everything() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let path = device_id_path(&tmp_dir);
        fs::write(&path, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();

        let sensor_id = resolve(&path, Some("fleet-assigned-id"));

        assert_eq!(sensor_id.value(), "fleet-assigned-id");
        assert_eq!(sensor_id.source(), SensorIdSource::Env);
    }

    #[test]
    fn empty_override_is_ignored() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let path = device_id_path(&tmp_dir);

        let sensor_id = resolve(&path, Some("  "));

        assert_ne!(sensor_id.source(), SensorIdSource::Env);
    }

    #[test]
    fn persisted_id_is_reused() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let path = device_id_path(&tmp_dir);
        fs::write(&path, "0123456789abcdef0123456789abcdef\n").unwrap();

        let sensor_id = resolve(&path, None);

        assert_eq!(sensor_id.value(), "0123456789abcdef0123456789abcdef");
        assert_eq!(sensor_id.source(), SensorIdSource::DeviceIdFile);
    }

    #[test]
    fn generated_id_is_32_hex_and_persisted() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let path = device_id_path(&tmp_dir);

        let sensor_id = resolve(&path, None);

        assert_eq!(sensor_id.source(), SensorIdSource::GeneratedNew);
        assert_eq!(sensor_id.value().len(), 32);
        assert!(sensor_id.value().chars().all(|c| c.is_ascii_hexdigit()));

        // A second resolution picks the persisted value back up.
        let again = resolve(&path, None);
        assert_eq!(again.value(), sensor_id.value());
        assert_eq!(again.source(), SensorIdSource::DeviceIdFile);
    }

    #[test]
    fn unwritable_location_degrades_to_memory_only() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let path = Utf8PathBuf::from(tmp_dir.path().to_str().unwrap()).join("no-such-dir/device_id.txt");

        let sensor_id = resolve(&path, None);

        assert_eq!(sensor_id.source(), SensorIdSource::GeneratedMemoryOnly);
        assert_eq!(sensor_id.value().len(), 32);
    }

    #[test]
    fn empty_existing_file_falls_back_to_volatile_id() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let path = device_id_path(&tmp_dir);
        fs::write(&path, "").unwrap();

        let sensor_id = resolve(&path, None);

        assert_eq!(sensor_id.source(), SensorIdSource::GeneratedFallback);
        assert_eq!(sensor_id.value().len(), 32);
    }
}
