//! Growable array backing the channel registry.
//!
//! The storage is an `Option<Box<[T]>>` paired with an explicit element
//! count. `None` means "no storage", and the count must then be zero. Every
//! mutation builds a new boxed slice of exactly the required length, so the
//! storage never carries spare capacity and a failed allocation leaves the
//! previous state untouched.
//!
//! [`Registry`] owns the `(array, count)` pair so callers never handle it
//! directly.

use thiserror::Error;

/// Errors returned by the array operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArrayError {
    /// Growing or shrinking the storage could not allocate.
    #[error("not enough memory to resize the array")]
    Allocation,

    /// The count does not describe the storage (for example a non-zero
    /// count with no storage at all).
    #[error("array count {count} does not match storage length {len}")]
    Inconsistent { count: usize, len: usize },

    /// No element matched.
    #[error("item not found in array")]
    NotFound,
}

fn check_consistent<T>(array: &Option<Box<[T]>>, count: usize) -> Result<(), ArrayError> {
    let len = array.as_ref().map_or(0, |items| items.len());
    if len != count {
        return Err(ArrayError::Inconsistent { count, len });
    }
    Ok(())
}

/// Append `item`, growing the storage by exactly one slot.
///
/// On error `array` and `count` are left as they were and `item` is dropped.
pub fn append<T>(array: &mut Option<Box<[T]>>, count: &mut usize, item: T) -> Result<(), ArrayError> {
    check_consistent(array, *count)?;

    let mut grown: Vec<T> = Vec::new();
    grown
        .try_reserve_exact(*count + 1)
        .map_err(|_| ArrayError::Allocation)?;

    if let Some(old) = array.take() {
        grown.extend(old.into_vec());
    }
    grown.push(item);

    *count = grown.len();
    *array = Some(grown.into_boxed_slice());
    Ok(())
}

/// Remove the first element matching `predicate` and hand it back.
///
/// The survivors keep their relative order. When the last element goes the
/// storage becomes `None` and the count zero.
pub fn remove_where<T, F>(
    array: &mut Option<Box<[T]>>,
    count: &mut usize,
    mut predicate: F,
) -> Result<T, ArrayError>
where
    F: FnMut(&T) -> bool,
{
    check_consistent(array, *count)?;

    let position = array
        .as_deref()
        .and_then(|items| items.iter().position(|item| predicate(item)))
        .ok_or(ArrayError::NotFound)?;

    let mut shrunk: Vec<T> = Vec::new();
    shrunk
        .try_reserve_exact(*count - 1)
        .map_err(|_| ArrayError::Allocation)?;

    let Some(old) = array.take() else {
        return Err(ArrayError::NotFound);
    };

    let mut removed = None;
    for (index, item) in old.into_vec().into_iter().enumerate() {
        if index == position {
            removed = Some(item);
        } else {
            shrunk.push(item);
        }
    }

    *count = shrunk.len();
    *array = if shrunk.is_empty() {
        None
    } else {
        Some(shrunk.into_boxed_slice())
    };

    removed.ok_or(ArrayError::NotFound)
}

/// Remove the first element equal to `item`.
pub fn remove<T: PartialEq>(
    array: &mut Option<Box<[T]>>,
    count: &mut usize,
    item: &T,
) -> Result<T, ArrayError> {
    remove_where(array, count, |candidate| candidate == item)
}

/// Owned `(array, count)` pair.
#[derive(Debug)]
pub struct Registry<T> {
    items: Option<Box<[T]>>,
    count: usize,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            items: None,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn as_slice(&self) -> &[T] {
        self.items.as_deref().unwrap_or(&[])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn push(&mut self, item: T) -> Result<(), ArrayError> {
        append(&mut self.items, &mut self.count, item)
    }

    pub fn remove_where<F>(&mut self, predicate: F) -> Result<T, ArrayError>
    where
        F: FnMut(&T) -> bool,
    {
        remove_where(&mut self.items, &mut self.count, predicate)
    }

    /// Mutable access to the first element matching `predicate`.
    pub fn find_mut<F>(&mut self, mut predicate: F) -> Option<&mut T>
    where
        F: FnMut(&T) -> bool,
    {
        self.items
            .as_deref_mut()
            .and_then(|items| items.iter_mut().find(|item| predicate(item)))
    }

    /// Take every element out, leaving the registry empty.
    pub fn drain(&mut self) -> Vec<T> {
        self.count = 0;
        self.items.take().map(|items| items.into_vec()).unwrap_or_default()
    }
}

impl<T: PartialEq> Registry<T> {
    pub fn remove(&mut self, item: &T) -> Result<T, ArrayError> {
        remove(&mut self.items, &mut self.count, item)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.as_slice().contains(item)
    }
}
