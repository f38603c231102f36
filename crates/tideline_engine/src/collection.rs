//! Collection descriptors.

use crate::error::{SyncError, SyncResult};
use crate::policy::SyncOptions;
use crate::record::{Record, RecordKey};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Default identity attribute.
pub const DEFAULT_ID_ATTRIBUTE: &str = "id";

type ParseHook = Arc<dyn Fn(Value) -> Value + Send + Sync>;
type Validator = Arc<dyn Fn(&Record) -> Result<(), String> + Send + Sync>;

/// Describes one collection: where it lives remotely, how its records are
/// identified and which sync flags it uses by default.
///
/// # Example
///
/// ```rust
/// use tideline_engine::{Collection, Record, SyncOptions};
///
/// let todos = Collection::new("/todos")
///     .with_options(SyncOptions::dual())
///     .with_validator(|record| match record.get("title") {
///         Some(_) => Ok(()),
///         None => Err("title is required".into()),
///     });
///
/// assert_eq!(todos.namespace(), "/todos");
/// assert!(todos.validate(&Record::new()).is_err());
/// ```
#[derive(Clone)]
pub struct Collection {
    namespace: String,
    id_attribute: String,
    options: SyncOptions,
    parse: Option<ParseHook>,
    validator: Option<Validator>,
}

impl Collection {
    /// Creates a collection whose namespace is also its remote path.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id_attribute: DEFAULT_ID_ATTRIBUTE.to_string(),
            options: SyncOptions::default(),
            parse: None,
            validator: None,
        }
    }

    /// Sets the identity attribute.
    pub fn with_id_attribute(mut self, id_attribute: impl Into<String>) -> Self {
        self.id_attribute = id_attribute.into();
        self
    }

    /// Sets the collection-level sync flags.
    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Transforms every remote response before it is merged locally.
    pub fn with_parse(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.parse = Some(Arc::new(f));
        self
    }

    /// Rejects records before they reach any store.
    pub fn with_validator(
        mut self,
        f: impl Fn(&Record) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(f));
        self
    }

    /// The namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The identity attribute.
    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    /// Collection-level sync flags.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Remote path of the collection.
    pub fn url(&self) -> &str {
        &self.namespace
    }

    /// Remote path of one record.
    pub fn record_url(&self, key: &RecordKey) -> String {
        format!("{}/{}", self.namespace.trim_end_matches('/'), key)
    }

    /// Applies the parse hook.
    pub fn parse(&self, response: Value) -> Value {
        match &self.parse {
            Some(f) => f(response),
            None => response,
        }
    }

    /// Runs the validator.
    pub fn validate(&self, record: &Record) -> SyncResult<()> {
        match &self.validator {
            Some(f) => f(record).map_err(SyncError::Validation),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("namespace", &self.namespace)
            .field("id_attribute", &self.id_attribute)
            .field("options", &self.options)
            .field("parse", &self.parse.is_some())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn urls() {
        let todos = Collection::new("/todos");
        assert_eq!(todos.url(), "/todos");
        assert_eq!(todos.record_url(&RecordKey::new("3")), "/todos/3");
        assert_eq!(
            Collection::new("/todos/").record_url(&RecordKey::new("3")),
            "/todos/3"
        );
    }

    #[test]
    fn parse_hook_unwraps_envelope() {
        let todos = Collection::new("/todos").with_parse(|body| body["data"].clone());
        assert_eq!(todos.parse(json!({"data": [1, 2]})), json!([1, 2]));
        assert_eq!(Collection::new("/x").parse(json!(5)), json!(5));
    }

    #[test]
    fn validation_failure() {
        let todos = Collection::new("/todos").with_validator(|r| {
            if r.get("title").is_some() {
                Ok(())
            } else {
                Err("title required".into())
            }
        });
        assert!(todos.validate(&Record::new().with("title", "a")).is_ok());
        assert!(matches!(
            todos.validate(&Record::new()),
            Err(SyncError::Validation(msg)) if msg == "title required"
        ));
    }

    #[test]
    fn custom_id_attribute() {
        let people = Collection::new("/people").with_id_attribute("_id");
        assert_eq!(people.id_attribute(), "_id");
    }
}
