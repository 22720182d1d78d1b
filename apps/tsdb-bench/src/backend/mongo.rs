//! MongoDB backend.
//!
//! Raw readings are flat documents in the raw collection:
//!
//! ```text
//! { timestamp: ISODate, asset_id: long, attribute_id: long,
//!   measurement: "raw", value: double }
//! ```
//!
//! Downsampling is a single aggregation that `$merge`s into the resolution
//! collection. `$merge` needs a unique index on its `on` fields, which
//! `connect` creates if missing.

use super::{Backend, BackendError};
use crate::config::Config;
use crate::harness::DownsampleWindow;
use crate::packet::{Measurement, Packet};
use async_trait::async_trait;
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use mongodb::options::{IndexOptions, InsertManyOptions};
use mongodb::{Client, Collection, IndexModel};

const MERGE_KEYS: [&str; 4] = ["timestamp", "asset_id", "attribute_id", "measurement"];

pub struct MongoDbBackend {
    raw: Collection<Document>,
    resolution: Collection<Document>,
    resolution_name: String,
    bucket_ms: i64,
}

impl MongoDbBackend {
    pub async fn connect(config: &Config) -> Result<Self, BackendError> {
        let client = Client::with_uri_str(&config.mongodb_url).await?;
        let database = client.database(&config.mongodb_database);
        database.run_command(doc! { "ping": 1 }, None).await?;

        let backend = Self::new(
            database.collection::<Document>(&config.raw_table),
            database.collection::<Document>(&config.resolution_table),
            config.resolution_table.clone(),
            i64::try_from(config.bucket().as_millis()).unwrap_or(i64::MAX),
        );
        backend.ensure_merge_index().await?;
        Ok(backend)
    }

    pub fn new(
        raw: Collection<Document>,
        resolution: Collection<Document>,
        resolution_name: String,
        bucket_ms: i64,
    ) -> Self {
        Self {
            raw,
            resolution,
            resolution_name,
            bucket_ms: bucket_ms.max(1),
        }
    }

    async fn ensure_merge_index(&self) -> Result<(), BackendError> {
        let mut keys = Document::new();
        for key in MERGE_KEYS {
            keys.insert(key, 1);
        }
        let index = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.resolution.create_index(index, None).await?;
        Ok(())
    }
}

fn encode_documents(packets: &[Packet]) -> Vec<Document> {
    packets
        .iter()
        .map(|packet| {
            doc! {
                "timestamp": BsonDateTime::from_millis(packet.timestamp.timestamp_millis()),
                "asset_id": i64::from(packet.asset_id),
                "attribute_id": i64::from(packet.attribute_id),
                "measurement": packet.measurement.as_str(),
                "value": packet.value,
            }
        })
        .collect()
}

fn downsample_pipeline(window: &DownsampleWindow, bucket_ms: i64, resolution: &str) -> Vec<Document> {
    let bucket_start = doc! {
        "$toDate": {
            "$subtract": [
                { "$toLong": "$timestamp" },
                { "$mod": [{ "$toLong": "$timestamp" }, bucket_ms] },
            ]
        }
    };
    vec![
        doc! {
            "$match": {
                "timestamp": {
                    "$gte": BsonDateTime::from_millis(window.start.timestamp_millis()),
                    "$lt": BsonDateTime::from_millis(window.end.timestamp_millis()),
                },
                "measurement": Measurement::Raw.as_str(),
            }
        },
        doc! {
            "$group": {
                "_id": {
                    "timestamp": bucket_start,
                    "asset_id": "$asset_id",
                    "attribute_id": "$attribute_id",
                },
                "value": { "$avg": "$value" },
            }
        },
        doc! {
            "$project": {
                "_id": 0,
                "timestamp": "$_id.timestamp",
                "asset_id": "$_id.asset_id",
                "attribute_id": "$_id.attribute_id",
                "measurement": { "$literal": Measurement::Mean.as_str() },
                "value": 1,
            }
        },
        doc! {
            "$merge": {
                "into": resolution,
                "on": MERGE_KEYS.to_vec(),
                "whenMatched": "replace",
                "whenNotMatched": "insert",
            }
        },
    ]
}

#[async_trait]
impl Backend for MongoDbBackend {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn insert(&self, packets: Vec<Packet>) -> Result<(), BackendError> {
        if packets.is_empty() {
            return Ok(());
        }
        let options = InsertManyOptions::builder().ordered(false).build();
        let result = self
            .raw
            .insert_many(encode_documents(&packets), options)
            .await?;
        tracing::debug!(rows = result.inserted_ids.len(), "inserted packet batch");
        Ok(())
    }

    async fn downsample(&self, window: DownsampleWindow) -> Result<(), BackendError> {
        let pipeline = downsample_pipeline(&window, self.bucket_ms, &self.resolution_name);
        self.raw.aggregate(pipeline, None).await?;
        tracing::debug!(collection = %self.resolution_name, %window, "downsampled window");
        Ok(())
    }
}
