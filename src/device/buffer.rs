use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A buffer living in device memory.
///
/// Cloning a buffer clones the handle, not the data. That's how kernels that
/// run on the command queue get to see the same memory as the host side that
/// scheduled them.
pub struct DeviceBuffer<T> {
    data: Arc<RwLock<Vec<T>>>,
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        DeviceBuffer { data: self.data.clone() }
    }
}

impl<T: Copy + Default> DeviceBuffer<T> {
    pub(crate) fn zeroed(len: usize) -> Self {
        DeviceBuffer { data: Arc::new(RwLock::new(vec![T::default(); len])) }
    }

    pub(crate) fn from_vec(data: Vec<T>) -> Self {
        DeviceBuffer { data: Arc::new(RwLock::new(data)) }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kernel side access. Host code goes through the command queue instead.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write()
    }

    pub fn fill(&self, value: T) {
        self.data.write().iter_mut().for_each(|v| *v = value);
    }

    pub fn same_memory(&self, other: &DeviceBuffer<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
