use super::{DataFrame, RowMask};
use rayon::prelude::*;
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("the row mask has {mask_len} rows but the frame has {n_rows}")]
	MaskLength { mask_len: usize, n_rows: usize },
	#[error("rows {start}..{end} are not within the frame's {n_rows} rows")]
	RowRange {
		start: usize,
		end: usize,
		n_rows: usize,
	},
	#[error("failed to start {n_threads} worker threads")]
	ThreadPool {
		n_threads: usize,
		#[source]
		source: rayon::ThreadPoolBuildError,
	},
}

/// The number of rows in each block of work handed to a worker.
pub const ROWS_PER_BLOCK: usize = 2048;

/**
A `WorkerPool` runs the row driver's blocks of work on up to `n_threads` threads. Build it once and share it between calls. With one thread there is no pool and blocks run on the calling thread.

Row ranges are cut into blocks of `rows_per_block` rows whatever the number of threads, and every block gets its own state. Reductions fold the block states in block order, so they give identical results for any `n_threads`.
*/
#[derive(Debug)]
pub struct WorkerPool {
	n_threads: usize,
	rows_per_block: usize,
	pool: Option<rayon::ThreadPool>,
}

impl WorkerPool {
	pub fn new(n_threads: usize) -> Result<Self, ReadError> {
		let n_threads = n_threads.max(1);
		let pool = if n_threads == 1 {
			None
		} else {
			let pool = rayon::ThreadPoolBuilder::new()
				.num_threads(n_threads)
				.build()
				.map_err(|source| ReadError::ThreadPool { n_threads, source })?;
			Some(pool)
		};
		Ok(Self {
			n_threads,
			rows_per_block: ROWS_PER_BLOCK,
			pool,
		})
	}

	pub fn with_rows_per_block(mut self, rows_per_block: usize) -> Self {
		self.rows_per_block = rows_per_block.max(1);
		self
	}

	pub fn n_threads(&self) -> usize {
		self.n_threads
	}

	pub fn rows_per_block(&self) -> usize {
		self.rows_per_block
	}

	/// Map `work` in parallel, keeping the order of the results.
	fn map<W, T, F>(&self, work: Vec<W>, f: F) -> Vec<T>
	where
		W: Send,
		T: Send,
		F: Fn(W) -> T + Sync + Send,
	{
		match &self.pool {
			Some(pool) if work.len() > 1 => pool.install(|| work.into_par_iter().map(f).collect()),
			_ => work.into_iter().map(f).collect(),
		}
	}
}

/// Split `range` into contiguous blocks of `rows_per_block` rows. The last block may be shorter. There is always at least one block, which is empty if the range is empty.
pub fn block_ranges(range: Range<usize>, rows_per_block: usize) -> Vec<Range<usize>> {
	let rows_per_block = rows_per_block.max(1);
	if range.start >= range.end {
		return vec![range.start..range.start];
	}
	(range.start..range.end)
		.step_by(rows_per_block)
		.map(|start| start..(start + rows_per_block).min(range.end))
		.collect()
}

impl DataFrame {
	/**
	Visit the rows in `row_range`, restricted to `mask` if one is given, on the workers of `pool`.

	The range is split into blocks of `pool.rows_per_block()` rows. Each block starts from a clone of `state` and `visit` is called on its rows in ascending row order. The blocks' states are returned in block order, so folding them front to back gives the same result for any number of threads.
	*/
	pub fn read_rows<S, F>(
		&self,
		pool: &WorkerPool,
		row_range: Range<usize>,
		mask: Option<&RowMask>,
		state: S,
		visit: F,
	) -> Result<Vec<S>, ReadError>
	where
		S: Clone + Send,
		F: Fn(&mut S, usize, &[f32]) + Sync,
	{
		self.check_rows(&row_range, mask)?;
		let work: Vec<(Range<usize>, S)> = block_ranges(row_range, pool.rows_per_block())
			.into_iter()
			.map(|chunk| (chunk, state.clone()))
			.collect();
		let read_chunk = |(chunk, mut state): (Range<usize>, S)| {
			match mask {
				Some(mask) => {
					for row_index in mask.ones_in(chunk) {
						visit(&mut state, row_index, self.row(row_index));
					}
				}
				None => {
					for row_index in chunk {
						visit(&mut state, row_index, self.row(row_index));
					}
				}
			}
			state
		};
		Ok(pool.map(work, read_chunk))
	}

	/**
	Mutate the rows in `row_range`, restricted to `mask` if one is given, on the workers of `pool`.

	Each block of rows is a disjoint slice of the storage, so `visit` may write any column of the row it is given. `init` creates each block's scratch state, and the states are returned in block order.
	*/
	pub fn write_columns<S, I, F>(
		&mut self,
		pool: &WorkerPool,
		row_range: Range<usize>,
		mask: Option<&RowMask>,
		init: I,
		visit: F,
	) -> Result<Vec<S>, ReadError>
	where
		S: Send,
		I: Fn() -> S + Sync,
		F: Fn(&mut S, usize, &mut [f32]) + Sync,
	{
		self.check_rows(&row_range, mask)?;
		let n_columns = self.n_columns();
		let chunks = block_ranges(row_range.clone(), pool.rows_per_block());
		// Hand each block its own slice of the storage.
		let mut rest =
			&mut self.values[row_range.start * n_columns..row_range.end * n_columns];
		let mut work: Vec<(Range<usize>, &mut [f32])> = Vec::with_capacity(chunks.len());
		for chunk in chunks {
			let (values, tail) = std::mem::take(&mut rest).split_at_mut(chunk.len() * n_columns);
			rest = tail;
			work.push((chunk, values));
		}
		let write_chunk = |(chunk, values): (Range<usize>, &mut [f32])| {
			let mut state = init();
			for (offset, row) in values.chunks_exact_mut(n_columns).enumerate() {
				let row_index = chunk.start + offset;
				if mask.map(|mask| mask.get(row_index)).unwrap_or(true) {
					visit(&mut state, row_index, row);
				}
			}
			state
		};
		Ok(pool.map(work, write_chunk))
	}

	fn check_rows(&self, row_range: &Range<usize>, mask: Option<&RowMask>) -> Result<(), ReadError> {
		if row_range.start > row_range.end || row_range.end > self.n_rows() {
			return Err(ReadError::RowRange {
				start: row_range.start,
				end: row_range.end,
				n_rows: self.n_rows(),
			});
		}
		if let Some(mask) = mask {
			if mask.len() != self.n_rows() {
				return Err(ReadError::MaskLength {
					mask_len: mask.len(),
					n_rows: self.n_rows(),
				});
			}
		}
		Ok(())
	}
}

/**
Reduce the rows of `frame` selected by `mask` to a single value.

Every block of rows starts from a clone of `zero` and is folded into it with `visit`. The result is seeded with the first block's state, and the remaining blocks' states are folded into it with `combine` in block order. The blocks do not depend on the number of threads, so neither does the result, even when `combine` is not associative as with floating point sums or sketches.
*/
pub fn reduce_rows<S, V, C>(
	frame: &DataFrame,
	pool: &WorkerPool,
	mask: &RowMask,
	zero: S,
	visit: V,
	mut combine: C,
) -> Result<S, ReadError>
where
	S: Clone + Send,
	V: Fn(&mut S, usize, &[f32]) + Sync,
	C: FnMut(&mut S, S),
{
	let mut states = frame
		.read_rows(pool, 0..frame.n_rows(), Some(mask), zero.clone(), visit)?
		.into_iter();
	let mut result = states.next().unwrap_or(zero);
	for state in states {
		combine(&mut result, state);
	}
	Ok(result)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::ColumnType;

	fn frame(n_rows: usize) -> DataFrame {
		let mut frame = DataFrame::new(
			vec!["x".to_owned(), "y".to_owned()],
			vec![ColumnType::Number, ColumnType::Number],
		);
		for i in 0..n_rows {
			frame.push_row(&[i as f32, (i % 7) as f32]);
		}
		frame
	}

	fn pool(n_threads: usize) -> WorkerPool {
		WorkerPool::new(n_threads).unwrap().with_rows_per_block(64)
	}

	#[test]
	fn test_block_ranges() {
		assert_eq!(block_ranges(0..10, 4), vec![0..4, 4..8, 8..10]);
		assert_eq!(block_ranges(5..7, 4), vec![5..7]);
		assert_eq!(block_ranges(3..3, 4), vec![3..3]);
	}

	#[test]
	fn test_reduce_matches_single_thread() {
		let frame = frame(1000);
		let mut mask = RowMask::new(500, true);
		mask.extend(false, 250);
		mask.extend(true, 250);
		let sum = |n_threads| {
			reduce_rows(
				&frame,
				&pool(n_threads),
				&mask,
				0.0f64,
				|sum, _, row| *sum += row[1] as f64,
				|sum, other| *sum += other,
			)
			.unwrap()
		};
		let expected: f64 = mask.ones().map(|i| (i % 7) as f64).sum();
		assert_eq!(sum(1), expected);
		assert_eq!(sum(4), expected);
	}

	#[test]
	fn test_float_reduction_does_not_depend_on_n_threads() {
		let mut frame = frame(0);
		for i in 0..1000 {
			frame.push_row(&[i as f32, 1.0 / (i as f32 + 3.0)]);
		}
		let mask = RowMask::new(1000, true);
		let sum = |n_threads| {
			reduce_rows(
				&frame,
				&pool(n_threads),
				&mask,
				0.0f64,
				|sum, _, row| *sum += (row[1] as f64).sin() * 1e-3 + 1e8,
				|sum, other| *sum += other,
			)
			.unwrap()
		};
		let single = sum(1);
		for &n_threads in &[2, 3, 8] {
			assert_eq!(sum(n_threads).to_bits(), single.to_bits());
		}
	}

	#[test]
	fn test_rows_are_visited_in_order() {
		let frame = frame(300);
		let mask = RowMask::from_sorted_indices(300, &[0, 3, 64, 65, 150, 299]);
		let visited = reduce_rows(
			&frame,
			&pool(3),
			&mask,
			Vec::new(),
			|visited: &mut Vec<usize>, row_index, _| visited.push(row_index),
			|visited, other| visited.extend(other),
		)
		.unwrap();
		assert_eq!(visited, mask.ones().collect::<Vec<_>>());
	}

	#[test]
	fn test_one_state_per_block() {
		let frame = frame(300);
		let states = frame
			.read_rows(&pool(2), 0..300, None, 0usize, |count, _, _| *count += 1)
			.unwrap();
		assert_eq!(states, vec![64, 64, 64, 64, 44]);
		assert_eq!(pool(2).n_threads(), 2);
		assert_eq!(WorkerPool::new(0).unwrap().n_threads(), 1);
	}

	#[test]
	fn test_mask_of_wrong_length_is_an_error() {
		let frame = frame(10);
		let result = reduce_rows(
			&frame,
			&pool(2),
			&RowMask::new(9, true),
			0usize,
			|count, _, _| *count += 1,
			|count, other| *count += other,
		);
		assert!(matches!(
			result,
			Err(ReadError::MaskLength {
				mask_len: 9,
				n_rows: 10
			})
		));
	}

	#[test]
	fn test_write_columns_only_touches_masked_rows() {
		let mut frame = frame(100);
		let mask = RowMask::from_sorted_indices(100, &[1, 50, 99]);
		let counts = frame
			.write_columns(
				&pool(4),
				0..100,
				Some(&mask),
				|| 0usize,
				|count, _, row| {
					row[1] = -1.0;
					*count += 1;
				},
			)
			.unwrap();
		assert_eq!(counts, vec![2, 1]);
		let written: Vec<usize> = (0..100).filter(|&i| frame.value(i, 1) == -1.0).collect();
		assert_eq!(written, vec![1, 50, 99]);
	}
}
