//! Quantifier prefix: an ordered sequence of blocks with distinct adjacent
//! types. The block index orders variables; block 0 is a placeholder so that
//! "no block" reads as index 0, and two sentinel empty blocks are appended
//! after parsing to host newly minted ghost and CEGAR variables.

use crate::error::{Result, SolverError};
use crate::lit::{Lit, Ply, Var};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QType {
    Forall,
    Exists,
    Free,
}

impl QType {
    pub fn letter(self) -> char {
        match self {
            QType::Forall => 'a',
            QType::Exists => 'e',
            QType::Free => 'f',
        }
    }

    pub fn from_letter(c: char) -> Option<QType> {
        match c.to_ascii_lowercase() {
            'a' => Some(QType::Forall),
            'e' => Some(QType::Exists),
            'f' => Some(QType::Free),
            _ => None,
        }
    }

    /// The player owning this block, if it has one.
    pub fn ply(self) -> Option<Ply> {
        match self {
            QType::Forall => Some(Ply::A),
            QType::Exists => Some(Ply::E),
            QType::Free => None,
        }
    }

    pub fn of_ply(ply: Ply) -> QType {
        match ply {
            Ply::A => QType::Forall,
            Ply::E => QType::Exists,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuantBlock {
    pub qtype: QType,
    pub ix: u16,
    pub vars: Vec<Var>,
}

#[derive(Debug, Clone)]
pub struct QuantPrefix {
    blocks: Vec<QuantBlock>,
}

pub const MAX_QB: u16 = (1 << 15) - 2;

impl QuantPrefix {
    pub fn new() -> QuantPrefix {
        QuantPrefix {
            // Placeholder so real blocks start at index 1.
            blocks: vec![QuantBlock {
                qtype: QType::Exists,
                ix: 0,
                vars: vec![],
            }],
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, ix: u16) -> &QuantBlock {
        &self.blocks[ix as usize]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &QuantBlock> {
        self.blocks.iter().skip(1)
    }

    /// Type of a block; `None` for the placeholder index 0.
    pub fn qtype(&self, ix: u16) -> Option<QType> {
        if ix == 0 {
            None
        } else {
            Some(self.blocks[ix as usize].qtype)
        }
    }

    pub fn last_qtype(&self) -> Option<QType> {
        self.qtype(self.blocks.len() as u16 - 1)
    }

    /// Appends a block, enforcing that adjacent blocks have distinct types.
    pub fn push_block(&mut self, qtype: QType) -> Result<u16> {
        if self.last_qtype() == Some(qtype) {
            return Err(SolverError::Parse(format!(
                "adjacent quantifier blocks both have type '{}'",
                qtype.letter()
            )));
        }
        let ix = self.blocks.len() as u16;
        if ix > MAX_QB {
            return Err(SolverError::Parse("too many quantifier blocks".to_string()));
        }
        self.blocks.push(QuantBlock {
            qtype,
            ix,
            vars: vec![],
        });
        Ok(ix)
    }

    pub fn add_var(&mut self, ix: u16, v: Var) {
        debug_assert_ne!(ix, 0);
        self.blocks[ix as usize].vars.push(v);
    }

    /// Walks inward from `from` to the first block of the given type.
    /// The sentinel blocks guarantee one exists for 'a' and 'e'.
    pub fn find_block_at_or_after(&self, from: u16, qtype: QType) -> Option<u16> {
        (from..self.blocks.len() as u16).find(|&ix| self.blocks[ix as usize].qtype == qtype)
    }
}

impl Default for QuantPrefix {
    fn default() -> Self {
        QuantPrefix::new()
    }
}

/// Per-variable block-index table; the order relation `u < v` iff
/// `qb[u] < qb[v]` governs Q-resolution.
#[derive(Debug, Clone, Default)]
pub struct BlockMap {
    qb: Vec<u16>,
}

impl BlockMap {
    pub fn new() -> BlockMap {
        BlockMap { qb: vec![0] }
    }

    pub fn ensure(&mut self, v: Var) {
        let n = v.idx() as usize + 1;
        if self.qb.len() < n {
            self.qb.resize(n, 0);
        }
    }

    #[inline]
    pub fn of_var(&self, v: Var) -> u16 {
        self.qb[v.idx() as usize]
    }

    #[inline]
    pub fn of_lit(&self, l: Lit) -> u16 {
        self.of_var(l.var())
    }

    pub fn set(&mut self, v: Var, qb: u16) {
        self.ensure(v);
        self.qb[v.idx() as usize] = qb;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_alternate() {
        let mut p = QuantPrefix::new();
        let b1 = p.push_block(QType::Exists).unwrap();
        assert_eq!(b1, 1);
        assert!(p.push_block(QType::Exists).is_err());
        let b2 = p.push_block(QType::Forall).unwrap();
        assert_eq!(b2, 2);
        assert_eq!(p.qtype(0), None);
        assert_eq!(p.qtype(1), Some(QType::Exists));
    }

    #[test]
    fn find_block_walks_inward() {
        let mut p = QuantPrefix::new();
        p.push_block(QType::Exists).unwrap();
        p.push_block(QType::Forall).unwrap();
        p.push_block(QType::Exists).unwrap();
        assert_eq!(p.find_block_at_or_after(1, QType::Forall), Some(2));
        assert_eq!(p.find_block_at_or_after(3, QType::Exists), Some(3));
        assert_eq!(p.find_block_at_or_after(3, QType::Forall), None);
    }

    #[test]
    fn block_map_orders_vars() {
        let mut m = BlockMap::new();
        m.set(Var::from_idx(1), 1);
        m.set(Var::from_idx(2), 3);
        assert!(m.of_var(Var::from_idx(1)) < m.of_var(Var::from_idx(2)));
        assert_eq!(m.of_lit(Var::from_idx(2).neg_lit()), 3);
    }
}
