use indexmap::IndexMap;

/// A single field of a parsed CLI record.
///
/// Vendor output repeats field names inside one logical record (e.g. the
/// `tier` rows of a vdisk listing); repeats promote the field to a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Merge another value into this one.
    ///
    /// Scalar + scalar forms a list, list + scalar appends, list + list
    /// concatenates.
    fn merge(self, other: FieldValue) -> FieldValue {
        let mut items = self.into_items();
        items.extend(other.into_items());
        FieldValue::List(items)
    }

    fn into_items(self) -> Vec<String> {
        match self {
            FieldValue::Scalar(s) => vec![s],
            FieldValue::List(v) => v,
        }
    }

    /// Collapse a list whose members are all equal back to the single item.
    fn compact(self) -> FieldValue {
        match self {
            FieldValue::List(v) if !v.is_empty() && v.iter().all(|x| *x == v[0]) => {
                FieldValue::Scalar(v.into_iter().next().unwrap())
            }
            other => other,
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            FieldValue::Scalar(s) => Some(s),
            FieldValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::Scalar(_) => None,
            FieldValue::List(v) => Some(v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Scalar(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Scalar(s)
    }
}

/// A string-keyed record produced by a response parser.
///
/// Field order follows first appearance in the output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    fields: IndexMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Record::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// The field as text: the scalar itself, or the first list member.
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.fields.get(key)? {
            FieldValue::Scalar(s) => Some(s),
            FieldValue::List(v) => v.first().map(String::as_str),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    /// Insert a value under `key`, promoting to a list on repeats.
    /// A repeated key keeps its original position.
    pub fn append(&mut self, key: &str, value: impl Into<FieldValue>) {
        let value = value.into();
        if let Some(existing) = self.fields.get_mut(key) {
            let taken = std::mem::replace(existing, FieldValue::List(Vec::new()));
            *existing = taken.merge(value);
        } else {
            self.fields.insert(key.to_string(), value);
        }
    }

    /// Insert a stripped key/value pair, promoting to a list on repeats.
    pub fn append_stripped(&mut self, key: &str, value: &str) {
        self.append(key.trim(), value.trim());
    }

    /// Replace the value under `key` unconditionally.
    pub fn set(&mut self, key: &str, value: impl Into<FieldValue>) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// Merge all fields of `other` into this record, then compact.
    pub fn merge_from(&mut self, other: &Record) {
        for (key, value) in other.iter() {
            self.append(key, value.clone());
        }
        self.compact();
    }

    /// Collapse every all-equal list field back to its single item.
    pub fn compact(&mut self) {
        for value in self.fields.values_mut() {
            let taken = std::mem::replace(value, FieldValue::List(Vec::new()));
            *value = taken.compact();
        }
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        let mut record = Record::new();
        for (key, value) in iter {
            record.append(&key, value);
        }
        record
    }
}
