use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign, Not, Range};

const WORD_BITS: usize = 64;

/**
A `RowMask` selects a subset of the rows of a `DataFrame`, one bit per row, packed into 64 bit words.

Masks that are combined with `&`, `|`, or `^` must have the same length, which is normally the number of rows in the frame. Combining masks of different lengths is a bug in the caller and panics. Bits past `len()` are always zero, so counts never see stale bits.
*/
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowMask {
	words: Vec<u64>,
	len: usize,
}

impl RowMask {
	/// Create a mask of `len` rows which are all set to `value`.
	pub fn new(len: usize, value: bool) -> Self {
		let mut mask = Self::default();
		mask.extend(value, len);
		mask
	}

	/// Create a mask of `len` rows with exactly the rows in `indices` set. The indices must be strictly increasing and less than `len`.
	pub fn from_sorted_indices(len: usize, indices: &[usize]) -> Self {
		let mut mask = Self::default();
		for &index in indices {
			assert!(
				index >= mask.len() && index < len,
				"row index {} is out of order or out of range for a mask of length {}",
				index,
				len,
			);
			mask.extend(false, index - mask.len());
			mask.push(true);
		}
		mask.extend(false, len - mask.len());
		mask
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Append a single row.
	pub fn push(&mut self, value: bool) {
		let bit = self.len % WORD_BITS;
		if bit == 0 {
			self.words.push(0);
		}
		if value {
			let last = self.words.len() - 1;
			self.words[last] |= 1 << bit;
		}
		self.len += 1;
	}

	/// Append a run of `count` rows all set to `value`.
	pub fn extend(&mut self, value: bool, count: usize) {
		let mut remaining = count;
		// Fill up the partially used last word one bit at a time.
		while remaining > 0 && self.len % WORD_BITS != 0 {
			self.push(value);
			remaining -= 1;
		}
		// Append whole words.
		let fill = if value { u64::MAX } else { 0 };
		while remaining >= WORD_BITS {
			self.words.push(fill);
			self.len += WORD_BITS;
			remaining -= WORD_BITS;
		}
		for _ in 0..remaining {
			self.push(value);
		}
	}

	pub fn get(&self, index: usize) -> bool {
		assert!(
			index < self.len,
			"row {} is out of range for a mask of length {}",
			index,
			self.len
		);
		(self.words[index / WORD_BITS] >> (index % WORD_BITS)) & 1 == 1
	}

	pub fn set(&mut self, index: usize, value: bool) {
		assert!(
			index < self.len,
			"row {} is out of range for a mask of length {}",
			index,
			self.len
		);
		let word = &mut self.words[index / WORD_BITS];
		if value {
			*word |= 1 << (index % WORD_BITS);
		} else {
			*word &= !(1 << (index % WORD_BITS));
		}
	}

	/// The number of rows that are set.
	pub fn count_ones(&self) -> usize {
		self.words
			.iter()
			.map(|word| word.count_ones() as usize)
			.sum()
	}

	/// The number of rows that are set in both `self` and `other`. This is `(self & other).count_ones()` without allocating the intersection.
	pub fn inner(&self, other: &Self) -> usize {
		self.assert_same_len(other);
		self.words
			.iter()
			.zip(other.words.iter())
			.map(|(a, b)| (a & b).count_ones() as usize)
			.sum()
	}

	/// Iterate over the indices of the rows that are set, in ascending order.
	pub fn ones(&self) -> Ones<'_> {
		self.ones_in(0..self.len)
	}

	/// Iterate over the indices of the rows in `range` that are set, in ascending order.
	pub fn ones_in(&self, range: Range<usize>) -> Ones<'_> {
		let end = range.end.min(self.len);
		let start = range.start.min(end);
		let word_index = start / WORD_BITS;
		let current = if start < end {
			self.words[word_index] & (u64::MAX << (start % WORD_BITS))
		} else {
			0
		};
		Ones {
			words: &self.words,
			word_index,
			current,
			end,
		}
	}

	fn assert_same_len(&self, other: &Self) {
		assert_eq!(
			self.len, other.len,
			"row masks of different lengths cannot be combined"
		);
	}

	fn clear_tail(&mut self) {
		let bit = self.len % WORD_BITS;
		if bit != 0 {
			let last = self.words.len() - 1;
			self.words[last] &= (1 << bit) - 1;
		}
	}
}

/// The iterator returned by `RowMask::ones` and `RowMask::ones_in`.
pub struct Ones<'a> {
	words: &'a [u64],
	word_index: usize,
	current: u64,
	end: usize,
}

impl<'a> Iterator for Ones<'a> {
	type Item = usize;

	fn next(&mut self) -> Option<usize> {
		loop {
			if self.current != 0 {
				let index = self.word_index * WORD_BITS + self.current.trailing_zeros() as usize;
				if index >= self.end {
					self.current = 0;
					self.word_index = self.words.len();
					return None;
				}
				// Clear the lowest set bit.
				self.current &= self.current - 1;
				return Some(index);
			}
			self.word_index += 1;
			if self.word_index >= self.words.len() || self.word_index * WORD_BITS >= self.end {
				return None;
			}
			self.current = self.words[self.word_index];
		}
	}
}

macro_rules! impl_row_mask_op {
	($trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident, $op:tt) => {
		impl<'a> $trait<&'a RowMask> for &'a RowMask {
			type Output = RowMask;
			fn $method(self, other: &'a RowMask) -> RowMask {
				let mut result = self.clone();
				result.$assign_method(other);
				result
			}
		}

		impl<'a> $assign_trait<&'a RowMask> for RowMask {
			fn $assign_method(&mut self, other: &'a RowMask) {
				self.assert_same_len(other);
				for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
					*a = *a $op *b;
				}
			}
		}
	};
}

impl_row_mask_op!(BitAnd, bitand, BitAndAssign, bitand_assign, &);
impl_row_mask_op!(BitOr, bitor, BitOrAssign, bitor_assign, |);
impl_row_mask_op!(BitXor, bitxor, BitXorAssign, bitxor_assign, ^);

impl<'a> Not for &'a RowMask {
	type Output = RowMask;
	fn not(self) -> RowMask {
		let mut result = RowMask {
			words: self.words.iter().map(|word| !word).collect(),
			len: self.len,
		};
		result.clear_tail();
		result
	}
}
