//! 256-bit vector banks as used by the IRR, ISR and TMR registers.

/// Eight 32-bit words, word `i` holding vectors `32 * i..32 * i + 32`.
///
/// This is the layout of the APIC register page, where word `i` lives at
/// offset `base + 0x10 * i`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VectorBitmap([u32; 8]);

impl VectorBitmap {
	pub const fn new() -> Self {
		Self([0; 8])
	}

	#[inline]
	fn locate(vector: u8) -> (usize, u32) {
		(usize::from(vector >> 5), 1 << (vector & 0x1f))
	}

	pub fn set(&mut self, vector: u8) {
		let (word, bit) = Self::locate(vector);
		self.0[word] |= bit;
	}

	pub fn clear(&mut self, vector: u8) {
		let (word, bit) = Self::locate(vector);
		self.0[word] &= !bit;
	}

	pub fn test(&self, vector: u8) -> bool {
		let (word, bit) = Self::locate(vector);
		self.0[word] & bit != 0
	}

	/// Sets `vector` and returns whether it was set before.
	pub fn test_and_set(&mut self, vector: u8) -> bool {
		let was_set = self.test(vector);
		self.set(vector);
		was_set
	}

	/// Clears `vector` and returns whether it was set before.
	pub fn test_and_clear(&mut self, vector: u8) -> bool {
		let was_set = self.test(vector);
		self.clear(vector);
		was_set
	}

	/// Returns the highest set vector, scanning from the top word down.
	pub fn highest(&self) -> Option<u8> {
		self.0
			.iter()
			.enumerate()
			.rev()
			.find(|(_, word)| **word != 0)
			.map(|(i, word)| (i as u8) * 32 + (31 - word.leading_zeros() as u8))
	}

	pub fn count(&self) -> u32 {
		self.0.iter().map(|w| w.count_ones()).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.0.iter().all(|w| *w == 0)
	}

	/// Raw register word `index` (0..8).
	pub fn word(&self, index: usize) -> u32 {
		self.0[index]
	}

	pub fn clear_all(&mut self) {
		self.0 = [0; 8];
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_vector_bitmap() {
		let mut bm = VectorBitmap::new();
		assert!(bm.is_empty());
		assert_eq!(bm.highest(), None);

		bm.set(0x30);
		bm.set(0x31);
		bm.set(0xff);
		bm.set(0);
		assert_eq!(bm.count(), 4);
		assert_eq!(bm.highest(), Some(0xff));
		assert_eq!(bm.word(1), 0b11 << 16);
		assert_eq!(bm.word(7), 1 << 31);

		assert!(bm.test_and_clear(0xff));
		assert!(!bm.test_and_clear(0xff));
		assert_eq!(bm.highest(), Some(0x31));
		assert!(!bm.test_and_set(0x40));
		assert!(bm.test_and_set(0x40));
		assert_eq!(bm.highest(), Some(0x40));

		bm.clear(0x40);
		bm.clear(0x31);
		bm.clear(0x30);
		assert_eq!(bm.highest(), Some(0));
		assert!(bm.test(0));

		bm.clear_all();
		assert!(bm.is_empty());
	}
}
