//! Voter registration lookups.
//!
//! The voter collection is owned by the registration system; this service
//! only reads it.

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::{Client, Collection};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("mongodb: {0}")]
    Mongo(#[from] mongodb::error::Error),
}

/// Where a voter's registered photo lives.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilePicture {
    #[serde(rename = "localPath", default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// The subset of a voter registration document this service reads.
#[derive(Debug, Clone, Deserialize)]
pub struct VoterRecord {
    #[serde(rename = "voterID")]
    pub voter_id: String,
    #[serde(rename = "fullName", default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "profilePicture", default)]
    pub profile_picture: Option<ProfilePicture>,
}

impl VoterRecord {
    /// `fullName`, else `name`, else the voter id.
    pub fn display_name(&self) -> String {
        [&self.full_name, &self.name]
            .into_iter()
            .flatten()
            .find(|n| !n.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| self.voter_id.clone())
    }

    pub fn local_path(&self) -> Option<&str> {
        self.profile_picture
            .as_ref()
            .and_then(|p| p.local_path.as_deref())
            .filter(|p| !p.is_empty())
    }

    pub fn url(&self) -> Option<&str> {
        self.profile_picture
            .as_ref()
            .and_then(|p| p.url.as_deref())
            .filter(|u| !u.is_empty())
    }
}

/// Read access to voter records.
#[async_trait]
pub trait VoterStore: Send + Sync {
    /// Exact-match lookup on `voterID`.
    async fn find_voter(&self, voter_id: &str) -> Result<Option<VoterRecord>, StoreError>;

    /// Liveness check of the backing connection.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// [`VoterStore`] over a MongoDB collection.
pub struct MongoVoterStore {
    client: Client,
    voters: Collection<VoterRecord>,
}

impl MongoVoterStore {
    /// Build a client for `uri`. The driver connects lazily, so an unreachable
    /// server surfaces on the first query or ping rather than here.
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        let voters = client.database(database).collection::<VoterRecord>(collection);
        tracing::info!(database, collection, "voter store configured");
        Ok(Self { client, voters })
    }
}

#[async_trait]
impl VoterStore for MongoVoterStore {
    async fn find_voter(&self, voter_id: &str) -> Result<Option<VoterRecord>, StoreError> {
        Ok(self.voters.find_one(doc! { "voterID": voter_id }).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod memory {
    //! In-memory [`VoterStore`] for tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct MemoryVoterStore {
        voters: HashMap<String, VoterRecord>,
        down: AtomicBool,
    }

    impl MemoryVoterStore {
        pub fn with_voter(mut self, record: VoterRecord) -> Self {
            self.voters.insert(record.voter_id.clone(), record);
            self
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Mongo(mongodb::error::Error::custom("store is down")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl VoterStore for MemoryVoterStore {
        async fn find_voter(&self, voter_id: &str) -> Result<Option<VoterRecord>, StoreError> {
            self.check()?;
            Ok(self.voters.get(voter_id).cloned())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.check()
        }
    }

    pub fn voter(id: &str, full_name: &str, local_path: Option<&str>, url: Option<&str>) -> VoterRecord {
        VoterRecord {
            voter_id: id.to_string(),
            full_name: Some(full_name.to_string()),
            name: None,
            profile_picture: Some(ProfilePicture {
                local_path: local_path.map(str::to_string),
                url: url.map(str::to_string),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_registration_document() {
        let json = serde_json::json!({
            "_id": "65f0c0ffee",
            "voterID": "ABC1234567",
            "fullName": "Asha Verma",
            "fatherName": "R. Verma",
            "gender": "Female",
            "profilePicture": { "url": "https://placehold.co/100x100", "localPath": "" },
            "email": "asha@example.com"
        });
        let record: VoterRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.display_name(), "Asha Verma");
        assert_eq!(record.local_path(), None);
        assert_eq!(record.url(), Some("https://placehold.co/100x100"));
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut record = memory::voter("V1", "  ", None, None);
        record.name = Some("Short Name".into());
        assert_eq!(record.display_name(), "Short Name");

        record.name = None;
        assert_eq!(record.display_name(), "V1");
    }

    #[test]
    fn test_missing_profile_picture() {
        let record: VoterRecord = serde_json::from_value(serde_json::json!({ "voterID": "V2" })).unwrap();
        assert!(record.profile_picture.is_none());
        assert_eq!(record.url(), None);
        assert_eq!(record.display_name(), "V2");
    }
}
