use super::*;
use anyhow::Result;
use fnv::FnvHashMap;
use std::{
	collections::{BTreeMap, BTreeSet},
	path::Path,
};

#[derive(Clone)]
pub struct FromCsvOptions<'a> {
	pub column_types: Option<BTreeMap<String, ColumnType>>,
	pub infer_options: InferOptions,
	pub invalid_values: &'a [&'a str],
}

impl<'a> Default for FromCsvOptions<'a> {
	fn default() -> Self {
		Self {
			column_types: None,
			infer_options: InferOptions::default(),
			invalid_values: DEFAULT_INVALID_VALUES,
		}
	}
}

#[derive(Clone, Debug)]
pub struct InferOptions {
	pub categorical_max_unique_values: usize,
}

impl Default for InferOptions {
	fn default() -> Self {
		Self {
			categorical_max_unique_values: 100,
		}
	}
}

/// These values are the default values that are considered missing.
const DEFAULT_INVALID_VALUES: &[&str] = &[
	"", "null", "NULL", "n/a", "N/A", "nan", "-nan", "NaN", "-NaN", "?",
];

/// The type a column ended up with after inference. Text columns have too many distinct values to be categorical and cannot be parsed as numbers, so they are not loaded.
#[derive(Clone, Debug, PartialEq)]
enum LoadColumnType {
	Load(ColumnType),
	Skip,
}

impl DataFrame {
	pub fn from_path(path: &Path, options: FromCsvOptions, progress: impl Fn(u64)) -> Result<Self> {
		Self::from_csv(&mut csv::Reader::from_path(path)?, options, progress)
	}

	pub fn from_csv<R>(
		reader: &mut csv::Reader<R>,
		options: FromCsvOptions,
		progress: impl Fn(u64),
	) -> Result<Self>
	where
		R: std::io::Read + std::io::Seek,
	{
		let column_names: Vec<String> = reader
			.headers()?
			.into_iter()
			.map(|column_name| column_name.to_owned())
			.collect();
		let start_position = reader.position().clone();
		let infer_options = &options.infer_options;
		let invalid_values = options.invalid_values;
		let mut n_rows = None;

		// Start from the column types given in the options and infer the rest.
		let mut column_types: Vec<Option<ColumnType>> = column_names
			.iter()
			.map(|column_name| {
				options
					.column_types
					.as_ref()
					.and_then(|column_types| column_types.get(column_name).cloned())
			})
			.collect();

		// If any column type is unknown, pass over the csv once to infer it.
		let column_types: Vec<LoadColumnType> = if column_types.iter().any(Option::is_none) {
			let mut infer_stats: Vec<(usize, InferStats)> = column_types
				.iter()
				.enumerate()
				.filter(|(_, column_type)| column_type.is_none())
				.map(|(index, _)| (index, InferStats::new(infer_options, invalid_values)))
				.collect();
			let mut record = csv::StringRecord::new();
			let mut n_rows_computed = 0;
			while reader.read_record(&mut record)? {
				n_rows_computed += 1;
				for (index, infer_stats) in infer_stats.iter_mut() {
					infer_stats.update(record.get(*index).unwrap_or(""));
				}
			}
			n_rows = Some(n_rows_computed);
			let mut inferred: BTreeMap<usize, LoadColumnType> = infer_stats
				.into_iter()
				.map(|(index, infer_stats)| (index, infer_stats.finalize()))
				.collect();
			// After inference, return back to the beginning of the csv to load the values.
			reader.seek(start_position)?;
			column_types
				.iter_mut()
				.enumerate()
				.map(|(index, column_type)| match column_type.take() {
					Some(column_type) => LoadColumnType::Load(column_type),
					None => inferred.remove(&index).unwrap_or(LoadColumnType::Skip),
				})
				.collect()
		} else {
			column_types
				.into_iter()
				.flatten()
				.map(LoadColumnType::Load)
				.collect()
		};

		// Text columns cannot be trained on, so leave them out of the frame.
		let mut loaded_columns = Vec::new();
		let mut loaded_names = Vec::new();
		let mut loaded_types = Vec::new();
		for (index, (column_name, column_type)) in
			column_names.iter().zip(column_types.into_iter()).enumerate()
		{
			match column_type {
				LoadColumnType::Load(ColumnType::Extra) | LoadColumnType::Skip => {
					tracing::warn!(column = %column_name, "skipping column that is neither numeric nor categorical");
				}
				LoadColumnType::Load(column_type) => {
					loaded_columns.push(index);
					loaded_names.push(column_name.clone());
					loaded_types.push(column_type);
				}
			}
		}
		if loaded_columns.is_empty() {
			anyhow::bail!("the csv has no numeric or categorical columns");
		}

		// Map each categorical option to its index.
		let option_indexes: Vec<Option<FnvHashMap<String, usize>>> = loaded_types
			.iter()
			.map(|column_type| match column_type {
				ColumnType::Categorical { options } => Some(
					options
						.iter()
						.enumerate()
						.map(|(index, option)| (option.clone(), index))
						.collect(),
				),
				_ => None,
			})
			.collect();

		// Create the dataframe. If an inference pass was done, reserve storage because we know how many rows are in the csv.
		let mut dataframe = Self::new(loaded_names, loaded_types);
		if let Some(n_rows) = n_rows {
			dataframe.reserve(n_rows);
		}
		// Read each csv record and append its values as a row of the dataframe.
		let mut record = csv::ByteRecord::new();
		let mut row = vec![0.0; loaded_columns.len()];
		while reader.read_byte_record(&mut record)? {
			if let Some(position) = record.position() {
				progress(position.byte());
			}
			for ((value, &column), option_indexes) in row
				.iter_mut()
				.zip(loaded_columns.iter())
				.zip(option_indexes.iter())
			{
				let field = record.get(column).unwrap_or(b"");
				*value = match option_indexes {
					None => match lexical::parse::<f32, &[u8]>(field) {
						Ok(value) if value.is_finite() => value,
						_ => std::f32::NAN,
					},
					Some(option_indexes) => std::str::from_utf8(field)
						.ok()
						.and_then(|field| option_indexes.get(field))
						.map(|index| *index as f32)
						.unwrap_or(std::f32::NAN),
				};
			}
			dataframe.push_row(&row);
		}
		Ok(dataframe)
	}
}

#[derive(Clone, Debug)]
pub struct InferStats<'a> {
	infer_options: &'a InferOptions,
	invalid_values: &'a [&'a str],
	column_type: InferColumnType,
	unique_values: Option<BTreeSet<String>>,
}

#[derive(PartialEq, Clone, Copy, Debug)]
enum InferColumnType {
	Unknown,
	Number,
	Categorical,
	Text,
}

impl<'a> InferStats<'a> {
	pub fn new(infer_options: &'a InferOptions, invalid_values: &'a [&'a str]) -> Self {
		Self {
			infer_options,
			invalid_values,
			column_type: InferColumnType::Unknown,
			unique_values: Some(BTreeSet::new()),
		}
	}

	pub fn update(&mut self, value: &str) {
		if self.invalid_values.contains(&value) {
			return;
		}
		if let Some(unique_values) = self.unique_values.as_mut() {
			if !unique_values.contains(value) {
				unique_values.insert(value.to_owned());
			}
			if unique_values.len() > self.infer_options.categorical_max_unique_values {
				self.unique_values = None;
			}
		}
		match self.column_type {
			InferColumnType::Unknown | InferColumnType::Number => {
				if lexical::parse::<f32, &str>(value)
					.map(|v| v.is_finite())
					.unwrap_or(false)
				{
					self.column_type = InferColumnType::Number;
				} else if self.unique_values.is_some() {
					self.column_type = InferColumnType::Categorical;
				} else {
					self.column_type = InferColumnType::Text;
				}
			}
			InferColumnType::Categorical => {
				if self.unique_values.is_none() {
					self.column_type = InferColumnType::Text;
				}
			}
			InferColumnType::Text => {}
		}
	}

	fn finalize(self) -> LoadColumnType {
		match self.column_type {
			// A column with only missing values carries no information.
			InferColumnType::Unknown => LoadColumnType::Skip,
			InferColumnType::Number => {
				// If all the values in a number column are zero or one then make this a categorical column instead.
				if let Some(unique_values) = self.unique_values {
					let mut values = unique_values.iter();
					if values.next().map(|s| s.as_str()) == Some("0")
						&& values.next().map(|s| s.as_str()) == Some("1")
						&& values.next().is_none()
					{
						return LoadColumnType::Load(ColumnType::Categorical {
							options: unique_values.into_iter().collect(),
						});
					}
				}
				LoadColumnType::Load(ColumnType::Number)
			}
			InferColumnType::Categorical => LoadColumnType::Load(ColumnType::Categorical {
				options: self.unique_values.unwrap_or_default().into_iter().collect(),
			}),
			InferColumnType::Text => LoadColumnType::Skip,
		}
	}
}

#[test]
fn test_infer() {
	let csv = r#"number,category,flag
1,test,0
2,?,1
"#;
	let df = DataFrame::from_csv(
		&mut csv::Reader::from_reader(std::io::Cursor::new(csv)),
		FromCsvOptions::default(),
		|_| {},
	)
	.unwrap();
	insta::assert_debug_snapshot!(df, @r###"
 DataFrame {
     column_names: [
         "number",
         "category",
         "flag",
     ],
     column_types: [
         Number,
         Categorical {
             options: [
                 "test",
             ],
         },
         Categorical {
             options: [
                 "0",
                 "1",
             ],
         },
     ],
     n_rows: 2,
     values: [
         1.0,
         0.0,
         0.0,
         2.0,
         NaN,
         1.0,
     ],
 }
 "###);
}

#[test]
fn test_column_types_and_text_columns() {
	let csv = r#"number,text,category
1,hello,b
2,world,a
"#;
	let mut column_types = BTreeMap::new();
	column_types.insert(
		"category".to_owned(),
		ColumnType::Categorical {
			options: vec!["a".to_owned(), "b".to_owned()],
		},
	);
	let df = DataFrame::from_csv(
		&mut csv::Reader::from_reader(std::io::Cursor::new(csv)),
		FromCsvOptions {
			column_types: Some(column_types),
			infer_options: InferOptions {
				categorical_max_unique_values: 1,
			},
			..Default::default()
		},
		|_| {},
	)
	.unwrap();
	insta::assert_debug_snapshot!(df, @r###"
 DataFrame {
     column_names: [
         "number",
         "category",
     ],
     column_types: [
         Number,
         Categorical {
             options: [
                 "a",
                 "b",
             ],
         },
     ],
     n_rows: 2,
     values: [
         1.0,
         1.0,
         2.0,
         0.0,
     ],
 }
 "###);
}
