//! Route Ledger: durable record of routes this node put into cloud tables
//!
//! Cloud routes outlive the process. To be able to take them back out after
//! a restart, every successful advertisement is written here and every
//! withdrawal removes its record.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "updated_at": "2026-02-24T12:00:00Z",
//!   "routes": [
//!     {
//!       "network": "10.1.0.0/24",
//!       "region": "us-east-1",
//!       "vpc_id": "vpc-0abc",
//!       "target": { "interface": "eni-0123" }
//!     }
//!   ]
//! }
//! ```

use crate::cloud::RouteTarget;
use crate::error::{LinkError, LinkResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// One route this node advertised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedRoute {
    /// Destination network (CIDR, v4 or v6)
    pub network: String,
    /// Region of the virtual network
    pub region: String,
    /// Virtual network id
    pub vpc_id: String,
    /// Next hop the route was pointed at
    pub target: RouteTarget,
}

/// Durable set of advertised routes, one per destination network
pub trait RouteLedger: Send + Sync {
    /// Insert or overwrite the record for `record.network`
    fn add(&self, record: &AdvertisedRoute) -> LinkResult<()>;

    /// Remove the record for `record.network`. Removing a missing record is not an error.
    fn remove(&self, record: &AdvertisedRoute) -> LinkResult<()>;

    /// All records, ordered by network
    fn list(&self) -> LinkResult<Vec<AdvertisedRoute>>;
}

/// On-disk layout
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    updated_at: String,
    #[serde(default)]
    routes: Vec<AdvertisedRoute>,
}

/// Ledger persisted as a JSON file
pub struct FileLedger {
    path: PathBuf,
    routes: Mutex<BTreeMap<String, AdvertisedRoute>>,
}

impl FileLedger {
    /// Open the ledger at `path`. A missing file is an empty ledger.
    pub fn open<P: AsRef<Path>>(path: P) -> LinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        let routes = match fs::read_to_string(&path) {
            Ok(content) => {
                let file: LedgerFile = serde_json::from_str(&content)
                    .map_err(|e| LinkError::parse("ledger: Failed to parse routes file", e))?;
                file.routes
                    .into_iter()
                    .map(|r| (r.network.clone(), r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(LinkError::read("ledger: Failed to read routes file", e)),
        };

        tracing::debug!("Loaded {} ledger records from {}", routes.len(), path.display());

        Ok(Self {
            path,
            routes: Mutex::new(routes),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, routes: &BTreeMap<String, AdvertisedRoute>) -> LinkResult<()> {
        let file = LedgerFile {
            version: 1,
            updated_at: chrono::Utc::now().to_rfc3339(),
            routes: routes.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| LinkError::parse("ledger: Failed to encode routes", e))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| LinkError::write("ledger: Failed to create ledger dir", e))?;
        }

        // Write-then-rename so a crash never leaves a truncated ledger
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| LinkError::write("ledger: Failed to write routes file", e))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| LinkError::write("ledger: Failed to replace routes file", e))?;
        Ok(())
    }
}

impl RouteLedger for FileLedger {
    fn add(&self, record: &AdvertisedRoute) -> LinkResult<()> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        if routes.get(&record.network) == Some(record) {
            return Ok(());
        }
        // Only a saved map becomes the in-memory view
        let mut next = routes.clone();
        next.insert(record.network.clone(), record.clone());
        self.save(&next)?;
        *routes = next;
        Ok(())
    }

    fn remove(&self, record: &AdvertisedRoute) -> LinkResult<()> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        if !routes.contains_key(&record.network) {
            return Ok(());
        }
        let mut next = routes.clone();
        next.remove(&record.network);
        self.save(&next)?;
        *routes = next;
        Ok(())
    }

    fn list(&self) -> LinkResult<Vec<AdvertisedRoute>> {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(routes.values().cloned().collect())
    }
}
