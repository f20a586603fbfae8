use std::collections::BTreeMap;
use std::fmt;

/// Query parameters for a backend request.
///
/// Kept sorted by name so two maps with the same pairs always serialize the
/// same way, whatever order they were built in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(BTreeMap<String, String>);

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert; later values replace earlier ones.
  pub fn with(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
    self.insert(name, value);
    self
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl fmt::Display) {
    self.0.insert(name.into(), value.to_string());
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(name).map(String::as_str)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// `application/x-www-form-urlencoded` form, without a leading `?`.
  pub fn to_query_string(&self) -> String {
    url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(self.iter())
      .finish()
  }
}

impl<K: Into<String>, V: fmt::Display> FromIterator<(K, V)> for Params {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut params = Params::new();
    for (k, v) in iter {
      params.insert(k, v);
    }
    params
  }
}
