use crate::error::{Result, TurnError};
use bytes::Bytes;
use log::{debug, trace};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use stun_rs::{StunMessage, TransactionId};
use tokio::sync::oneshot;

/// Response that completed a transaction.
#[derive(Debug)]
pub struct TransactionResponse {
    pub message: StunMessage,
    pub from: SocketAddr,
}

pub type TransactionResult = Result<TransactionResponse>;

/// An outstanding request. The result slot is written at most once, either
/// by the dispatch loop, by the caller's own timeout or by the client
/// shutting down; whoever gets there first wins.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    to: SocketAddr,
    raw: Bytes,
    transmissions: AtomicU16,
    result: Mutex<Option<oneshot::Sender<TransactionResult>>>,
}

impl Transaction {
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn to(&self) -> SocketAddr {
        self.to
    }

    /// Encoded request, kept for retransmissions.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn transmissions(&self) -> u16 {
        self.transmissions.load(Ordering::Acquire)
    }

    pub(crate) fn transmitted(&self) -> u16 {
        self.transmissions.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Delivers the outcome to the waiting caller. Returns false if the
    /// result was already written or nobody is waiting anymore.
    pub fn write_result(&self, result: TransactionResult) -> bool {
        let sender = self
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }
}

/// Outstanding transactions keyed by transaction id.
#[derive(Debug, Default)]
pub struct TransactionMap {
    transactions: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
}

impl TransactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks a random transaction id that is not currently outstanding.
    pub fn next_id(&self) -> TransactionId {
        let transactions = self.lock();
        loop {
            let id = TransactionId::from(rand::random::<[u8; 12]>());
            if !transactions.contains_key(&id) {
                return id;
            }
            debug!("[{:?}] Random transaction id collision, retrying", id);
        }
    }

    /// Registers a transaction for `id`. The receiver resolves once the
    /// transaction's result is written.
    pub fn register(
        &self,
        id: TransactionId,
        to: SocketAddr,
        raw: Bytes,
    ) -> Result<(Arc<Transaction>, oneshot::Receiver<TransactionResult>)> {
        let mut transactions = self.lock();
        if transactions.contains_key(&id) {
            return Err(TurnError::DuplicateTransaction(id));
        }

        let (tx, rx) = oneshot::channel();
        let transaction = Arc::new(Transaction {
            id,
            to,
            raw,
            transmissions: AtomicU16::new(0),
            result: Mutex::new(Some(tx)),
        });
        transactions.insert(id, transaction.clone());
        trace!("[{:?}] Registered transaction to {}", id, to);
        Ok((transaction, rx))
    }

    pub fn find(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.lock().remove(id)
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Removes every outstanding transaction and fails it with the error
    /// produced by `error`. Returns how many callers were woken.
    pub fn close_and_fail_all<F>(&self, error: F) -> usize
    where
        F: Fn() -> TurnError,
    {
        let drained: Vec<Arc<Transaction>> = self.lock().drain().map(|(_, tr)| tr).collect();
        let mut woken = 0;
        for tr in drained {
            debug!("[{:?}] Failing outstanding transaction", tr.id());
            if tr.write_result(Err(error())) {
                woken += 1;
            }
        }
        woken
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TransactionId, Arc<Transaction>>> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
