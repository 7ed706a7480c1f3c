use crate::error::BufferError;

use super::layout::Field;
use super::value::FieldValue;

fn check(len: usize, range: &std::ops::Range<usize>) -> Result<(), BufferError> {
    if range.end > len {
        return Err(BufferError::OutOfRange {
            offset: range.start,
            end: range.end,
            len,
        });
    }
    Ok(())
}

/// Read-only window over one entity's state block.
///
/// `get` panics if the field belongs to a larger type than this block, the
/// same way slice indexing does; `try_get` reports it instead.
#[derive(Debug, Clone, Copy)]
pub struct StateView<'a> {
    bytes: &'a [u8],
}

impl<'a> StateView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn get<T: FieldValue>(&self, field: Field<T>) -> T {
        T::read(&self.bytes[field.range()])
    }

    pub fn try_get<T: FieldValue>(&self, field: Field<T>) -> Result<T, BufferError> {
        let range = field.range();
        check(self.bytes.len(), &range)?;
        Ok(T::read(&self.bytes[range]))
    }
}

#[derive(Debug)]
pub struct StateViewMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> StateViewMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &*self.bytes
    }

    pub fn as_view(&self) -> StateView<'_> {
        StateView::new(&*self.bytes)
    }

    pub fn get<T: FieldValue>(&self, field: Field<T>) -> T {
        T::read(&self.bytes[field.range()])
    }

    pub fn set<T: FieldValue>(&mut self, field: Field<T>, value: T) {
        value.write(&mut self.bytes[field.range()]);
    }

    pub fn try_set<T: FieldValue>(&mut self, field: Field<T>, value: T) -> Result<(), BufferError> {
        let range = field.range();
        check(self.bytes.len(), &range)?;
        value.write(&mut self.bytes[range]);
        Ok(())
    }

    pub fn update<T: FieldValue>(&mut self, field: Field<T>, f: impl FnOnce(T) -> T) {
        let value = self.get(field);
        self.set(field, f(value));
    }
}
