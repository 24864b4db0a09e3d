//! MongoDB implementation of the document store.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info};

use crate::core::{CronExecution, Execution, ExecutionStatus, StepRecord};

use super::doc::{DocStore, ExecutionFilter, ExecutionUpdate};
use super::error::{Result, StorageError};

pub struct MongoDoc {
    db: Database,
    executions: Collection<Execution>,
    steps: Collection<StepRecord>,
    cron_executions: Collection<CronExecution>,
}

impl MongoDoc {
    /// Connects to the store at `url` and opens `database`.
    pub async fn connect(url: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(url)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let db = client.database(database);
        debug!("connected to mongodb database {}", database);
        Ok(Self {
            executions: db.collection("executions"),
            steps: db.collection("steps"),
            cron_executions: db.collection("cron_executions"),
            db,
        })
    }

    fn filter_to_document(filter: &ExecutionFilter) -> Document {
        let mut query = Document::new();
        match filter.statuses.len() {
            0 => {}
            1 => {
                query.insert("status", filter.statuses[0].as_str());
            }
            _ => {
                let statuses: Vec<Bson> = filter
                    .statuses
                    .iter()
                    .map(|s| Bson::String(s.as_str().to_string()))
                    .collect();
                query.insert("status", doc! {"$in": statuses});
            }
        }
        if let Some(event_name) = &filter.event_name {
            query.insert("eventName", event_name.as_str());
        }
        query
    }
}

fn db_err(e: mongodb::error::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn insert_err(collection: &'static str, key: &str, e: mongodb::error::Error) -> StorageError {
    use mongodb::error::{ErrorKind, WriteFailure};
    if let ErrorKind::Write(WriteFailure::WriteError(write_error)) = &*e.kind {
        // 11000 is the server's duplicate-key code
        if write_error.code == 11000 {
            return StorageError::DuplicateKey {
                collection,
                key: key.to_string(),
            };
        }
    }
    db_err(e)
}

#[async_trait]
impl DocStore for MongoDoc {
    async fn ping(&self) -> Result<()> {
        self.db
            .run_command(doc! {"ping": 1})
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.executions
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"id": 1})
                    .options(unique())
                    .build(),
            )
            .await
            .map_err(db_err)?;
        self.executions
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"status": 1, "createdAt": -1})
                    .build(),
            )
            .await
            .map_err(db_err)?;
        self.executions
            .create_index(IndexModel::builder().keys(doc! {"createdAt": -1}).build())
            .await
            .map_err(db_err)?;
        self.executions
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"eventName": 1, "createdAt": -1})
                    .build(),
            )
            .await
            .map_err(db_err)?;

        self.steps
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"executionId": 1, "timestamp": 1})
                    .build(),
            )
            .await
            .map_err(db_err)?;
        self.steps
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"executionId": 1, "stepId": 1})
                    .options(unique())
                    .build(),
            )
            .await
            .map_err(db_err)?;

        self.cron_executions
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"functionId": 1})
                    .options(unique())
                    .build(),
            )
            .await
            .map_err(db_err)?;

        info!("document store indexes ensured");
        Ok(())
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        self.executions
            .insert_one(execution)
            .await
            .map_err(|e| insert_err("executions", &execution.id, e))?;
        Ok(())
    }

    async fn find_execution(&self, id: &str) -> Result<Option<Execution>> {
        self.executions
            .find_one(doc! {"id": id})
            .await
            .map_err(db_err)
    }

    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>> {
        let query = Self::filter_to_document(&filter);
        let order = if filter.oldest_first { 1 } else { -1 };

        let mut find = self
            .executions
            .find(query)
            .sort(doc! {"createdAt": order})
            .skip(filter.skip);
        if let Some(limit) = filter.limit {
            find = find.limit(limit);
        }

        let cursor = find.await.map_err(db_err)?;
        cursor.try_collect().await.map_err(db_err)
    }

    async fn count_executions(&self, status: Option<ExecutionStatus>) -> Result<u64> {
        let query = match status {
            Some(status) => doc! {"status": status.as_str()},
            None => Document::new(),
        };
        self.executions
            .count_documents(query)
            .await
            .map_err(db_err)
    }

    async fn update_execution(&self, id: &str, update: ExecutionUpdate) -> Result<()> {
        let mut set = doc! {"updatedAt": update.updated_at};
        if let Some(status) = update.status {
            set.insert("status", status.as_str());
        }
        if let Some(attempt_count) = update.attempt_count {
            set.insert("attemptCount", attempt_count as i64);
        }
        if let Some(result) = &update.result {
            let value = mongodb::bson::to_bson(result)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            set.insert("result", value);
        }
        if let Some(error) = &update.error {
            set.insert("error", error.as_str());
        }
        if let Some(stack) = &update.error_stack {
            set.insert("errorStack", stack.as_str());
        }

        let mut change = doc! {"$set": set};
        if update.clear_errors {
            change.insert("$unset", doc! {"error": "", "errorStack": ""});
        }

        self.executions
            .update_one(doc! {"id": id}, change)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_step(&self, step: &StepRecord) -> Result<()> {
        let replacement = mongodb::bson::to_document(step)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        self.steps
            .update_one(
                doc! {"executionId": &step.execution_id, "stepId": &step.step_id},
                doc! {"$set": replacement},
            )
            .upsert(true)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn steps_for_execution(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        let cursor = self
            .steps
            .find(doc! {"executionId": execution_id})
            .sort(doc! {"timestamp": 1})
            .await
            .map_err(db_err)?;
        cursor.try_collect().await.map_err(db_err)
    }

    async fn upsert_cron_execution(&self, record: &CronExecution) -> Result<()> {
        let replacement = mongodb::bson::to_document(record)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        self.cron_executions
            .update_one(
                doc! {"functionId": &record.function_id},
                doc! {"$set": replacement},
            )
            .upsert(true)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn find_cron_execution(&self, function_id: &str) -> Result<Option<CronExecution>> {
        self.cron_executions
            .find_one(doc! {"functionId": function_id})
            .await
            .map_err(db_err)
    }
}
