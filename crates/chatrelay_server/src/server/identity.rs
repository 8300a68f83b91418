#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use chatrelay_domain::{ChannelSet, IdentityId, IdentityRecord};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("identity not found")]
	NotFound,

	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

/// Durable lookup and creation of identity records.
#[async_trait::async_trait]
pub trait IdentityStore: Send + Sync {
	async fn get(&self, id: &IdentityId) -> Result<IdentityRecord, StoreError>;

	async fn insert(&self, record: &IdentityRecord) -> Result<(), StoreError>;

	async fn set_display_name(&self, record: &IdentityRecord, name: &str) -> Result<(), StoreError>;
}

/// Process-local store used when persistence is disabled.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
	records: Mutex<HashMap<IdentityId, IdentityRecord>>,
}

impl InMemoryIdentityStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Store seeded with pre-provisioned records.
	pub fn with_records(records: impl IntoIterator<Item = IdentityRecord>) -> Self {
		let store = Self::new();
		{
			let mut guard = store.records.lock();
			for record in records {
				guard.insert(record.id.clone(), record);
			}
		}
		store
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.records.lock().len()
	}

	#[cfg(test)]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait::async_trait]
impl IdentityStore for InMemoryIdentityStore {
	async fn get(&self, id: &IdentityId) -> Result<IdentityRecord, StoreError> {
		self.records.lock().get(id).cloned().ok_or(StoreError::NotFound)
	}

	async fn insert(&self, record: &IdentityRecord) -> Result<(), StoreError> {
		let mut guard = self.records.lock();
		if guard.contains_key(&record.id) {
			return Err(StoreError::Backend(anyhow!("identity {} already exists", record.id)));
		}
		guard.insert(record.id.clone(), record.clone());
		Ok(())
	}

	async fn set_display_name(&self, record: &IdentityRecord, name: &str) -> Result<(), StoreError> {
		let mut guard = self.records.lock();
		let entry = guard.get_mut(&record.id).ok_or(StoreError::NotFound)?;
		entry.display_name = name.to_string();
		Ok(())
	}
}

/// SQL-backed store (`sqlite:`, `postgres:`, `mysql:`).
#[derive(Clone)]
pub struct SqlIdentityStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

type IdentityRow = (String, String, String, String);

impl SqlIdentityStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			Ok(Self {
				backend: SqlBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}

	/// Operator helper: replace channel grants for an identity.
	pub async fn set_channels(&self, id: &IdentityId, receive: &ChannelSet, send: &ChannelSet) -> anyhow::Result<()> {
		let receive = encode_channels(receive)?;
		let send = encode_channels(send)?;

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"UPDATE identities SET receive_channels = ?, send_channels = ?, updated_at = strftime('%s','now') \
					WHERE id = ?",
				)
				.bind(receive)
				.bind(send)
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("update channels (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"UPDATE identities SET receive_channels = $1, send_channels = $2, updated_at = NOW() WHERE id = $3",
				)
				.bind(receive)
				.bind(send)
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("update channels (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("UPDATE identities SET receive_channels = ?, send_channels = ?, updated_at = NOW() WHERE id = ?")
					.bind(receive)
					.bind(send)
					.bind(id.as_str())
					.execute(pool)
					.await
					.context("update channels (mysql)")?;
			}
		}

		Ok(())
	}
}

#[async_trait::async_trait]
impl IdentityStore for SqlIdentityStore {
	async fn get(&self, id: &IdentityId) -> Result<IdentityRecord, StoreError> {
		let row: Option<IdentityRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, display_name, receive_channels, send_channels FROM identities WHERE id = ?")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await
					.context("select identity (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, display_name, receive_channels, send_channels FROM identities WHERE id = $1")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await
					.context("select identity (postgres)")?
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query_as("SELECT id, display_name, receive_channels, send_channels FROM identities WHERE id = ?")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await
					.context("select identity (mysql)")?
			}
		};

		let Some(row) = row else {
			return Err(StoreError::NotFound);
		};
		Ok(record_from_row(row)?)
	}

	async fn insert(&self, record: &IdentityRecord) -> Result<(), StoreError> {
		let receive = encode_channels(&record.receive_channels)?;
		let send = encode_channels(&record.send_channels)?;

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO identities (id, display_name, receive_channels, send_channels, created_at, updated_at) \
					VALUES (?, ?, ?, ?, strftime('%s','now'), strftime('%s','now'))",
				)
				.bind(record.id.as_str())
				.bind(&record.display_name)
				.bind(receive)
				.bind(send)
				.execute(pool)
				.await
				.context("insert identity (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO identities (id, display_name, receive_channels, send_channels, created_at, updated_at) \
					VALUES ($1, $2, $3, $4, NOW(), NOW())",
				)
				.bind(record.id.as_str())
				.bind(&record.display_name)
				.bind(receive)
				.bind(send)
				.execute(pool)
				.await
				.context("insert identity (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO identities (id, display_name, receive_channels, send_channels, created_at, updated_at) \
					VALUES (?, ?, ?, ?, NOW(), NOW())",
				)
				.bind(record.id.as_str())
				.bind(&record.display_name)
				.bind(receive)
				.bind(send)
				.execute(pool)
				.await
				.context("insert identity (mysql)")?;
			}
		}

		Ok(())
	}

	async fn set_display_name(&self, record: &IdentityRecord, name: &str) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE identities SET display_name = ?, updated_at = strftime('%s','now') WHERE id = ?")
					.bind(name)
					.bind(record.id.as_str())
					.execute(pool)
					.await
					.context("update display_name (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE identities SET display_name = $1, updated_at = NOW() WHERE id = $2")
					.bind(name)
					.bind(record.id.as_str())
					.execute(pool)
					.await
					.context("update display_name (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("UPDATE identities SET display_name = ?, updated_at = NOW() WHERE id = ?")
					.bind(name)
					.bind(record.id.as_str())
					.execute(pool)
					.await
					.context("update display_name (mysql)")?;
			}
		}

		Ok(())
	}
}

fn encode_channels(channels: &ChannelSet) -> anyhow::Result<String> {
	serde_json::to_string(&channels.to_vec()).context("encode channel set")
}

fn decode_channels(raw: &str) -> anyhow::Result<ChannelSet> {
	if raw.trim().is_empty() {
		return Ok(ChannelSet::new());
	}
	let ids: Vec<u32> = serde_json::from_str(raw).with_context(|| format!("decode channel set {raw:?}"))?;
	Ok(ids.into_iter().collect())
}

fn record_from_row((id, display_name, receive, send): IdentityRow) -> anyhow::Result<IdentityRecord> {
	Ok(IdentityRecord {
		id: IdentityId::new(id).context("stored identity id")?,
		display_name,
		receive_channels: decode_channels(&receive)?,
		send_channels: decode_channels(&send)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn id(s: &str) -> IdentityId {
		IdentityId::new(s).expect("valid id")
	}

	#[tokio::test]
	async fn in_memory_get_insert_rename() {
		let store = InMemoryIdentityStore::new();
		assert!(matches!(store.get(&id("tok1")).await, Err(StoreError::NotFound)));

		let record = IdentityRecord::new(id("tok1"));
		store.insert(&record).await.expect("insert");
		assert!(store.insert(&record).await.is_err(), "duplicate insert must fail");

		store.set_display_name(&record, "srvA").await.expect("rename");
		assert_eq!(store.get(&id("tok1")).await.expect("get").display_name, "srvA");
	}

	#[tokio::test]
	async fn in_memory_rename_of_unknown_identity_is_not_found() {
		let store = InMemoryIdentityStore::new();
		let record = IdentityRecord::new(id("ghost"));
		assert!(matches!(
			store.set_display_name(&record, "x").await,
			Err(StoreError::NotFound)
		));
	}

	#[test]
	fn channel_columns_accept_blank_and_json() {
		assert!(decode_channels("").expect("blank").is_empty());
		let set = decode_channels("[3, 1]").expect("json");
		assert_eq!(set.to_vec(), vec![1, 3]);
		assert!(decode_channels("{").is_err());
		assert_eq!(encode_channels(&set).expect("encode"), "[1,3]");
	}

	#[tokio::test]
	async fn sqlite_store_persists_records_and_channels() {
		let dir = tempfile::tempdir().expect("tempdir");
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("relay.db").display());
		let store = SqlIdentityStore::connect(&url).await.expect("connect sqlite");

		assert!(matches!(store.get(&id("tok1")).await, Err(StoreError::NotFound)));

		let record = IdentityRecord::new(id("tok1"));
		store.insert(&record).await.expect("insert");
		store
			.set_channels(&record.id, &[1u32, 2].into_iter().collect(), &[2u32].into_iter().collect())
			.await
			.expect("grant channels");
		store.set_display_name(&record, "srvA").await.expect("rename");

		let loaded = store.get(&record.id).await.expect("get");
		assert_eq!(loaded.display_name, "srvA");
		assert_eq!(loaded.receive_channels.to_vec(), vec![1, 2]);
		assert_eq!(loaded.send_channels.to_vec(), vec![2]);
	}
}
