//! Object store: chain ops keyed by hash, plus their chain positions
//!
//! Two backends: [`MemoryStore`] (hash-keyed arena) and [`Storage`]
//! (sled + bincode). Both track terminal ops, i.e. ops nothing is known
//! to build on.

use crate::types::{Block, ChainOp, ChainPosition, Hash};
use sled::{Db, Tree};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

pub trait ObjectStore: Send + Sync {
    fn load(&self, id: &Hash) -> Result<Option<ChainOp>, StoreError>;

    /// Chain position metadata; None for unknown ids (e.g. a block still being mined)
    fn load_position(&self, id: &Hash) -> Result<Option<ChainPosition>, StoreError>;

    fn put(&self, op: &ChainOp, position: ChainPosition) -> Result<(), StoreError>;

    /// Ops with no known successor
    fn terminals(&self) -> Result<Vec<Hash>, StoreError>;

    fn contains(&self, id: &Hash) -> Result<bool, StoreError> {
        Ok(self.load_position(id)?.is_some())
    }

    fn load_block(&self, id: &Hash) -> Result<Option<Block>, StoreError> {
        Ok(match self.load(id)? {
            Some(ChainOp::Block(b)) => Some(b),
            _ => None,
        })
    }
}

// ============================================================================
// MEMORY
// ============================================================================

#[derive(Default)]
struct Arena {
    ops: HashMap<Hash, ChainOp>,
    positions: HashMap<Hash, ChainPosition>,
    has_successor: HashSet<Hash>,
    terminals: HashSet<Hash>,
}

#[derive(Default)]
pub struct MemoryStore {
    arena: RwLock<Arena>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena.read().map(|a| a.ops.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn load(&self, id: &Hash) -> Result<Option<ChainOp>, StoreError> {
        let arena = self.arena.read().map_err(|_| StoreError::Poisoned)?;
        Ok(arena.ops.get(id).cloned())
    }

    fn load_position(&self, id: &Hash) -> Result<Option<ChainPosition>, StoreError> {
        let arena = self.arena.read().map_err(|_| StoreError::Poisoned)?;
        Ok(arena.positions.get(id).copied())
    }

    fn put(&self, op: &ChainOp, position: ChainPosition) -> Result<(), StoreError> {
        let mut arena = self.arena.write().map_err(|_| StoreError::Poisoned)?;
        let hash = op.hash();
        for p in op.predecessors() {
            arena.terminals.remove(&p);
            arena.has_successor.insert(p);
        }
        if !arena.has_successor.contains(&hash) {
            arena.terminals.insert(hash);
        }
        arena.ops.insert(hash, op.clone());
        arena.positions.insert(hash, position);
        Ok(())
    }

    fn terminals(&self) -> Result<Vec<Hash>, StoreError> {
        let arena = self.arena.read().map_err(|_| StoreError::Poisoned)?;
        Ok(arena.terminals.iter().copied().collect())
    }
}

// ============================================================================
// SLED
// ============================================================================

pub struct Storage {
    db: Db,
    ops: Tree,
    positions: Tree,
    successors: Tree,
    terminals: Tree,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// Throwaway database, removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        let ops = db.open_tree("ops")?;
        let positions = db.open_tree("positions")?;
        let successors = db.open_tree("successors")?;
        let terminals = db.open_tree("terminals")?;
        Ok(Self { db, ops, positions, successors, terminals })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl ObjectStore for Storage {
    fn load(&self, id: &Hash) -> Result<Option<ChainOp>, StoreError> {
        match self.ops.get(id)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn load_position(&self, id: &Hash) -> Result<Option<ChainPosition>, StoreError> {
        match self.positions.get(id)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn put(&self, op: &ChainOp, position: ChainPosition) -> Result<(), StoreError> {
        let hash = op.hash();
        for p in op.predecessors() {
            self.terminals.remove(p)?;
            self.successors.insert(p, &[1u8][..])?;
        }
        if !self.successors.contains_key(hash)? {
            self.terminals.insert(hash, &[1u8][..])?;
        }
        self.ops.insert(hash, bincode::serialize(op)?)?;
        self.positions.insert(hash, bincode::serialize(&position)?)?;
        Ok(())
    }

    fn terminals(&self) -> Result<Vec<Hash>, StoreError> {
        let mut out = Vec::new();
        for item in self.terminals.iter() {
            let (key, _) = item?;
            if let Ok(hash) = <Hash>::try_from(key.as_ref()) {
                out.push(hash);
            }
        }
        Ok(out)
    }
}
