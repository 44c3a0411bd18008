//! Single writer thread. Every mutation runs inside one transaction on a
//! dedicated connection, so SQLite never sees two concurrent writers.

use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use log::{debug, error};
use tokio::sync::{mpsc, oneshot};

use clinicsync_core::errors::{Error, Result};

use super::{DbConnection, DbPool};
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(Result<&mut SqliteConnection>) + Send>;

/// Transaction error: either diesel itself or the job's own error.
enum TxError {
    Diesel(diesel::result::Error),
    Job(Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Diesel(err)
    }
}

#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl WriteHandle {
    /// Runs `job` on the writer connection inside a transaction. The
    /// transaction rolls back when the job returns an error.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped: Job = Box::new(move |conn| {
            let result = conn.and_then(|conn| {
                conn.transaction::<T, TxError, _>(|tx| job(tx).map_err(TxError::Job))
                    .map_err(|err| match err {
                        TxError::Diesel(e) => Error::from(StorageError::from(e)),
                        TxError::Job(e) => e,
                    })
            });
            let _ = reply_tx.send(result);
        });

        self.tx
            .send(wrapped)
            .map_err(|_| Error::database("writer thread has stopped"))?;
        reply_rx
            .await
            .map_err(|_| Error::database("writer thread dropped the reply"))?
    }
}

/// Spawns the writer thread. It exits once every [`WriteHandle`] is dropped.
pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

    std::thread::spawn(move || {
        let mut conn: Option<DbConnection> = None;
        while let Some(job) = rx.blocking_recv() {
            if conn.is_none() {
                match pool.get() {
                    Ok(acquired) => conn = Some(acquired),
                    Err(err) => {
                        error!("[LocalStore] Writer could not acquire a connection: {}", err);
                        job(Err(StorageError::from(err).into()));
                        continue;
                    }
                }
            }
            if let Some(conn) = conn.as_mut() {
                job(Ok(&mut **conn));
            }
        }
        debug!("[LocalStore] Writer thread stopped");
    });

    WriteHandle { tx }
}
