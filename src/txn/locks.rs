//! Per-key write lock table
//!
//! The table is owned by a single task; callers talk to it over an mpsc
//! channel and get answers on oneshot channels. A key has at most one
//! holder. Waiters queue FIFO behind the holder and are granted the lock in
//! order when it is released.
//!
//! A waiter that gives up (lock-wait timeout) sends `Cancel`. If the grant
//! raced ahead of the cancel, the cancel reports the lock as held and the
//! caller keeps it.

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::types::{Key, TxId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// What to do when a key is already locked by another transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Queue behind the holder for at most this long
    Wait(Duration),
    /// Fail immediately with a retryable conflict
    NoWait,
}

#[derive(Debug)]
enum LockReply {
    Granted,
    Conflict(TxId),
}

enum LockCommand {
    Acquire {
        tx: TxId,
        key: Key,
        wait: bool,
        reply: oneshot::Sender<LockReply>,
    },
    Cancel {
        tx: TxId,
        key: Key,
        reply: oneshot::Sender<(bool, Option<TxId>)>,
    },
    ReleaseAll {
        tx: TxId,
        reply: oneshot::Sender<usize>,
    },
    Holder {
        key: Key,
        reply: oneshot::Sender<Option<TxId>>,
    },
    Stats {
        reply: oneshot::Sender<LockStats>,
    },
}

/// Lock table counters
#[derive(Debug, Clone, Default)]
pub struct LockStats {
    pub held: usize,
    pub waiting: usize,
    pub grants: u64,
    pub conflicts: u64,
}

struct KeyLock {
    holder: TxId,
    waiters: VecDeque<(TxId, oneshot::Sender<LockReply>)>,
}

#[derive(Default)]
struct LockState {
    locks: HashMap<Key, KeyLock>,
    held_by: HashMap<TxId, HashSet<Key>>,
    /// Key each queued transaction is waiting on
    waiting_on: HashMap<TxId, Key>,
    grants: u64,
    conflicts: u64,
}

impl LockState {
    fn grant(&mut self, tx: TxId, key: Key) {
        self.held_by.entry(tx).or_default().insert(key);
        self.grants += 1;
    }

    fn acquire(&mut self, tx: TxId, key: Key, wait: bool, reply: oneshot::Sender<LockReply>) {
        let Some(lock) = self.locks.get_mut(&key) else {
            self.locks.insert(
                key.clone(),
                KeyLock {
                    holder: tx,
                    waiters: VecDeque::new(),
                },
            );
            self.grant(tx, key);
            let _ = reply.send(LockReply::Granted);
            return;
        };

        if lock.holder == tx {
            let _ = reply.send(LockReply::Granted);
        } else if wait {
            lock.waiters.push_back((tx, reply));
            self.waiting_on.insert(tx, key);
        } else {
            let holder = lock.holder;
            self.conflicts += 1;
            let _ = reply.send(LockReply::Conflict(holder));
        }
    }

    /// Hand `key` to the next live waiter, or drop the entry
    fn pass_on(&mut self, key: &Key) {
        let Some(lock) = self.locks.get_mut(key) else {
            return;
        };
        while let Some((next, reply)) = lock.waiters.pop_front() {
            self.waiting_on.remove(&next);
            // A waiter whose receiver is gone has already given up
            if reply.send(LockReply::Granted).is_ok() {
                lock.holder = next;
                self.held_by.entry(next).or_default().insert(key.clone());
                self.grants += 1;
                return;
            }
        }
        self.locks.remove(key);
    }

    fn cancel(&mut self, tx: TxId, key: &Key) -> (bool, Option<TxId>) {
        let Some(lock) = self.locks.get_mut(key) else {
            return (false, None);
        };
        if lock.holder == tx {
            return (true, Some(tx));
        }
        lock.waiters.retain(|(waiter, _)| *waiter != tx);
        self.waiting_on.remove(&tx);
        self.conflicts += 1;
        (false, Some(lock.holder))
    }

    fn release_all(&mut self, tx: TxId) -> usize {
        if let Some(key) = self.waiting_on.remove(&tx) {
            if let Some(lock) = self.locks.get_mut(&key) {
                lock.waiters.retain(|(waiter, _)| *waiter != tx);
            }
        }
        let keys = self.held_by.remove(&tx).unwrap_or_default();
        for key in &keys {
            self.pass_on(key);
        }
        keys.len()
    }

    fn stats(&self) -> LockStats {
        LockStats {
            held: self.locks.len(),
            waiting: self.locks.values().map(|l| l.waiters.len()).sum(),
            grants: self.grants,
            conflicts: self.conflicts,
        }
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<LockCommand>) {
    let mut state = LockState::default();
    while let Some(command) = commands.recv().await {
        match command {
            LockCommand::Acquire {
                tx,
                key,
                wait,
                reply,
            } => state.acquire(tx, key, wait, reply),
            LockCommand::Cancel { tx, key, reply } => {
                let _ = reply.send(state.cancel(tx, &key));
            }
            LockCommand::ReleaseAll { tx, reply } => {
                let _ = reply.send(state.release_all(tx));
            }
            LockCommand::Holder { key, reply } => {
                let _ = reply.send(state.locks.get(&key).map(|l| l.holder));
            }
            LockCommand::Stats { reply } => {
                let _ = reply.send(state.stats());
            }
        }
    }
    tracing::debug!("Lock table stopped");
}

/// Handle to the lock table task
#[derive(Clone)]
pub struct LockTable {
    commands: mpsc::UnboundedSender<LockCommand>,
}

impl LockTable {
    /// Start the lock table task on the current runtime. It stops once every
    /// handle is dropped.
    pub fn spawn() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run(receiver));
        Self { commands }
    }

    fn send(&self, command: LockCommand) -> StoreResult<()> {
        self.commands.send(command).map_err(|_| StoreError::Closed)
    }

    async fn ask<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> LockCommand,
    ) -> StoreResult<T> {
        let (reply, answer) = oneshot::channel();
        self.send(command(reply))?;
        answer.await.map_err(|_| StoreError::Closed)
    }

    /// Take the write lock on `key` for `tx`. Re-acquiring a held lock is a
    /// no-op.
    pub async fn acquire(&self, tx: TxId, key: &Key, policy: LockPolicy) -> StoreResult<()> {
        let wait = matches!(policy, LockPolicy::Wait(_));
        let (reply, mut answer) = oneshot::channel();
        self.send(LockCommand::Acquire {
            tx,
            key: key.clone(),
            wait,
            reply,
        })?;

        let outcome = match policy {
            LockPolicy::NoWait => answer.await.map_err(|_| StoreError::Closed)?,
            LockPolicy::Wait(limit) => match tokio::time::timeout(limit, &mut answer).await {
                Ok(reply) => reply.map_err(|_| StoreError::Closed)?,
                Err(_) => {
                    let (granted, holder) = self
                        .ask(|reply| LockCommand::Cancel {
                            tx,
                            key: key.clone(),
                            reply,
                        })
                        .await?;
                    if granted {
                        LockReply::Granted
                    } else {
                        tracing::debug!("{} gave up waiting for {} after {:?}", tx, key, limit);
                        LockReply::Conflict(holder.unwrap_or(tx))
                    }
                }
            },
        };

        match outcome {
            LockReply::Granted => Ok(()),
            LockReply::Conflict(holder) => Err(StoreError::Conflict {
                key: key.to_string(),
                holder,
            }),
        }
    }

    /// Release every lock `tx` holds (and any wait it has queued). Returns
    /// the number of keys released.
    pub async fn release_all(&self, tx: TxId) -> StoreResult<usize> {
        self.ask(|reply| LockCommand::ReleaseAll { tx, reply }).await
    }

    pub async fn holder(&self, key: &Key) -> StoreResult<Option<TxId>> {
        self.ask(|reply| LockCommand::Holder {
            key: key.clone(),
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> StoreResult<LockStats> {
        self.ask(|reply| LockCommand::Stats { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(path: &str) -> Key {
        Key::new(path).unwrap()
    }

    #[tokio::test]
    async fn test_no_wait_conflict() {
        let locks = LockTable::spawn();
        let k = key("/a");
        locks.acquire(TxId(1), &k, LockPolicy::NoWait).await.unwrap();
        // Re-entrant for the holder
        locks.acquire(TxId(1), &k, LockPolicy::NoWait).await.unwrap();

        let err = locks.acquire(TxId(2), &k, LockPolicy::NoWait).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, StoreError::Conflict { holder: TxId(1), .. }));

        assert_eq!(locks.release_all(TxId(1)).await.unwrap(), 1);
        locks.acquire(TxId(2), &k, LockPolicy::NoWait).await.unwrap();
        assert_eq!(locks.holder(&k).await.unwrap(), Some(TxId(2)));
    }

    #[tokio::test]
    async fn test_waiters_granted_in_order() {
        let locks = LockTable::spawn();
        let k = key("/queue");
        locks.acquire(TxId(1), &k, LockPolicy::NoWait).await.unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for id in 2..5u64 {
            let locks = locks.clone();
            let k = k.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                locks
                    .acquire(TxId(id), &k, LockPolicy::Wait(Duration::from_secs(5)))
                    .await
                    .unwrap();
                order.lock().push(id);
                locks.release_all(TxId(id)).await.unwrap();
            }));
            // Let each waiter enqueue before the next
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(locks.stats().await.unwrap().waiting, 3);
        locks.release_all(TxId(1)).await.unwrap();
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![2, 3, 4]);
        assert_eq!(locks.stats().await.unwrap().held, 0);
    }

    #[tokio::test]
    async fn test_wait_times_out_with_conflict() {
        let locks = LockTable::spawn();
        let k = key("/slow");
        locks.acquire(TxId(1), &k, LockPolicy::NoWait).await.unwrap();

        let err = locks
            .acquire(TxId(2), &k, LockPolicy::Wait(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { holder: TxId(1), .. }));

        // The abandoned wait must not inherit the lock
        locks.release_all(TxId(1)).await.unwrap();
        assert_eq!(locks.holder(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_drops_queued_wait() {
        let locks = LockTable::spawn();
        let k = key("/rolled-back");
        locks.acquire(TxId(1), &k, LockPolicy::NoWait).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            let k = k.clone();
            tokio::spawn(async move {
                locks
                    .acquire(TxId(2), &k, LockPolicy::Wait(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Transaction 2 is rolled back while queued
        locks.release_all(TxId(2)).await.unwrap();
        locks.release_all(TxId(1)).await.unwrap();
        assert_eq!(locks.holder(&k).await.unwrap(), None);
        waiter.abort();
    }
}
