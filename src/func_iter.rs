//! Walks a device's capability map one level at a time.
//!
//! A handle starts on the function names. `open_child` descends into the variants of the current
//! function, or the subvariants of the current variant. Each level owns a snapshot of its items,
//! so handles stay valid however the caller interleaves them.

use crate::device::capability::{SubvariantList, SupportedFuncMap, VariantMap};
use crate::error::{RsmiResult, Status};

/// Position within one level of the map.
#[derive(Debug, Clone)]
pub struct Cursor<T> {
    items: Vec<T>,
    pos: usize,
}

impl<T> Cursor<T> {
    fn new(items: Vec<T>) -> RsmiResult<Self> {
        if items.is_empty() {
            return Err(Status::NoData.into());
        }
        Ok(Self { items, pos: 0 })
    }

    fn current(&self) -> &T {
        &self.items[self.pos]
    }

    fn advance(&mut self) -> RsmiResult<()> {
        if self.pos + 1 >= self.items.len() {
            return Err(Status::NoData.into());
        }
        self.pos += 1;
        Ok(())
    }
}

/// The value under an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncIterValue {
    Name(&'static str),
    Id(u64),
}

#[derive(Debug, Clone)]
pub enum FuncIter {
    Function(Cursor<(&'static str, Option<VariantMap>)>),
    Variant(Cursor<(u64, Option<SubvariantList>)>),
    Subvariant(Cursor<u64>),
}

impl FuncIter {
    /// Iterator over the function names of `map`.
    ///
    /// # Errors
    /// `NoData` for an empty map.
    pub fn functions(map: &SupportedFuncMap) -> RsmiResult<Self> {
        let items = map.iter().map(|(name, v)| (*name, v.clone())).collect();
        Cursor::new(items).map(Self::Function)
    }

    /// Iterator over the children of the current item.
    ///
    /// # Errors
    /// `NoData` when the current item has no children; `InvalidArgs` on a subvariant iterator.
    pub fn open_child(&self) -> RsmiResult<Self> {
        match self {
            Self::Function(c) => {
                let variants = c.current().1.as_ref().ok_or(Status::NoData)?;
                let items = variants.iter().map(|(id, s)| (*id, s.clone())).collect();
                Cursor::new(items).map(Self::Variant)
            }
            Self::Variant(c) => {
                let subs = c.current().1.as_ref().ok_or(Status::NoData)?;
                Cursor::new(subs.clone()).map(Self::Subvariant)
            }
            Self::Subvariant(_) => Err(Status::InvalidArgs.into()),
        }
    }

    /// Moves to the next item.
    ///
    /// # Errors
    /// `NoData` past the last item; the iterator stays on the last item.
    pub fn next(&mut self) -> RsmiResult<()> {
        match self {
            Self::Function(c) => c.advance(),
            Self::Variant(c) => c.advance(),
            Self::Subvariant(c) => c.advance(),
        }
    }

    #[must_use]
    pub fn value(&self) -> FuncIterValue {
        match self {
            Self::Function(c) => FuncIterValue::Name(c.current().0),
            Self::Variant(c) => FuncIterValue::Id(c.current().0),
            Self::Subvariant(c) => FuncIterValue::Id(*c.current()),
        }
    }
}
