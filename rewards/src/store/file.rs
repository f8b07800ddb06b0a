use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minecycle_core::CycleState;
use std::path::PathBuf;
use tokio::fs;

use super::{CycleStore, StoreError};

/// Local cache: one JSON file per user.
pub struct FileCycleStore {
    dir: PathBuf,
}

impl FileCycleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(user_id)))
    }
}

/// Filesystem-safe, collision-free name for a user id.
fn file_stem(user_id: &str) -> String {
    let mut out = String::with_capacity(user_id.len());
    for b in user_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

#[async_trait]
impl CycleStore for FileCycleStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn read(&self, user_id: &str) -> Result<Option<CycleState>, StoreError> {
        let path = self.path_for(user_id);
        let data = match fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: CycleState = serde_json::from_str(&data)?;
        Ok(Some(state))
    }

    async fn write(&self, state: &CycleState) -> Result<Option<DateTime<Utc>>, StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&state.user_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(None)
    }
}
