//! Scope guard that zeroes a borrowed key buffer when it goes out of scope.
//!
//! Key buffers handed to the unwrap and decrypt engines are owned by the
//! caller. The guard borrows them for the duration of the call and scrubs
//! them on every exit path, including early `?` returns and future drops.

use std::ops::{Deref, DerefMut};
use zeroize::Zeroize;

pub struct ScrubOnDrop<'a>(&'a mut [u8]);

impl<'a> ScrubOnDrop<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self(buf)
    }
}

impl Deref for ScrubOnDrop<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0
    }
}

impl DerefMut for ScrubOnDrop<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.0
    }
}

impl Drop for ScrubOnDrop<'_> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails_midway(buf: &mut [u8]) -> Result<(), ()> {
        let guard = ScrubOnDrop::new(buf);
        if guard[0] == 0xAA {
            return Err(());
        }
        Ok(())
    }

    #[test]
    fn test_scrubs_on_early_return() {
        let mut key = vec![0xAAu8; 32];
        assert!(fails_midway(&mut key).is_err());
        assert!(key.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_scrubs_on_success() {
        let mut key = vec![0x11u8; 16];
        assert!(fails_midway(&mut key).is_ok());
        assert!(key.iter().all(|&b| b == 0));
    }
}
