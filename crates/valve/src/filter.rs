//! Byte-stream filters applied to relayed traffic.
//!
//! Filters are ordered interceptors invoked once per chunk per direction.
//! Each filter sees the chunk's current bytes and may leave them untouched,
//! replace them (the replacement may have a different length), or drop the
//! chunk by writing an empty replacement. Later filters in the chain see the
//! output of earlier ones. Filters are matched per chunk: a token split
//! across two reads is not rewritten.
//!
//! Filter implementations are registered in a [`FilterRegistry`] under a
//! string identifier; configuration names identifiers, and the registry
//! builds a fresh filter instance per connection, so implementations may
//! keep per-connection state.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use common::ValveError;

/// One chunk of relayed data presented to a filter.
pub struct FilterData<'a> {
    original: &'a [u8],
    modified: Option<BytesMut>,
    controlled: bool,
}

impl<'a> FilterData<'a> {
    fn new(original: &'a [u8], controlled: bool) -> Self {
        Self {
            original,
            modified: None,
            controlled,
        }
    }

    /// The chunk bytes as produced by the previous filter (or the wire).
    pub fn original(&self) -> &[u8] {
        self.original
    }

    /// True when the chunk belongs to a controlled connection.
    pub fn is_controlled(&self) -> bool {
        self.controlled
    }

    /// The replacement buffer, created empty on first access.
    ///
    /// Leaving it untouched passes the chunk through unchanged; writing
    /// bytes replaces the chunk; accessing it and writing nothing drops the
    /// chunk.
    pub fn modified(&mut self) -> &mut BytesMut {
        self.modified.get_or_insert_with(BytesMut::new)
    }

    fn into_modified(self) -> Option<BytesMut> {
        self.modified
    }
}

/// A byte-stream interceptor.
///
/// Errors terminate the owning connection; a chunk is never half-filtered.
pub trait Filter: Send {
    /// Called for each chunk flowing client → server.
    fn on_client_data(&mut self, data: &mut FilterData<'_>) -> io::Result<()>;

    /// Called for each chunk flowing server → client.
    fn on_server_data(&mut self, data: &mut FilterData<'_>) -> io::Result<()>;
}

/// Outcome of running a chunk through a [`FilterChain`].
#[derive(Debug, PartialEq, Eq)]
pub enum Filtered {
    /// No filter touched the chunk; write the original bytes.
    Unchanged,
    /// The chain produced replacement bytes.
    Replaced(BytesMut),
    /// A filter dropped the chunk entirely.
    Dropped,
}

/// Constructor for per-connection filter instances.
pub type FilterFactory = Arc<dyn Fn() -> Box<dyn Filter> + Send + Sync>;

/// Maps configuration identifiers to filter constructors.
///
/// The registry is populated at startup by the embedding application;
/// configuration then references filters by identifier only, so no dynamic
/// code loading is involved.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Filter> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_owned(), Arc::new(factory));
    }

    /// Resolves configured identifiers to factories, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`ValveError::UnknownFilter`] for the first unknown name.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<FilterFactory>, ValveError> {
        names
            .iter()
            .map(|name| {
                self.factories
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ValveError::UnknownFilter(name.clone()))
            })
            .collect()
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("FilterRegistry").field("filters", &names).finish()
    }
}

/// The ordered filter instances of one connection.
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
    controlled: bool,
}

impl FilterChain {
    /// Instantiates one filter per factory for a new connection.
    pub fn build(factories: &[FilterFactory], controlled: bool) -> Self {
        Self {
            filters: factories.iter().map(|f| f()).collect(),
            controlled,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs a chunk through every filter in declaration order.
    ///
    /// # Errors
    ///
    /// Propagates the first filter error; the caller treats it like an I/O
    /// error and terminates the connection.
    pub fn apply(&mut self, from_client: bool, input: &[u8]) -> io::Result<Filtered> {
        let mut owned: Option<BytesMut> = None;

        for filter in &mut self.filters {
            let modified = {
                let current: &[u8] = owned.as_deref().unwrap_or(input);
                let mut data = FilterData::new(current, self.controlled);
                if from_client {
                    filter.on_client_data(&mut data)?;
                } else {
                    filter.on_server_data(&mut data)?;
                }
                data.into_modified()
            };

            if let Some(chunk) = modified {
                if chunk.is_empty() {
                    return Ok(Filtered::Dropped);
                }
                owned = Some(chunk);
            }
        }

        Ok(match owned {
            Some(bytes) => Filtered::Replaced(bytes),
            None => Filtered::Unchanged,
        })
    }
}

/// Rewrites every occurrence of a token in client data and the reverse
/// substitution in server data, so a relayed dialogue stays symmetric.
pub struct SubstitutionFilter {
    find: Vec<u8>,
    replace: Vec<u8>,
}

impl SubstitutionFilter {
    /// Client data has `find` rewritten to `replace`; server data has
    /// `replace` rewritten back to `find`.
    pub fn new(find: impl Into<Vec<u8>>, replace: impl Into<Vec<u8>>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
        }
    }

    fn substitute(data: &mut FilterData<'_>, find: &[u8], replace: &[u8]) {
        if let Some(rewritten) = replace_all(data.original(), find, replace) {
            data.modified().extend_from_slice(&rewritten);
        }
    }
}

impl Filter for SubstitutionFilter {
    fn on_client_data(&mut self, data: &mut FilterData<'_>) -> io::Result<()> {
        Self::substitute(data, &self.find, &self.replace);
        Ok(())
    }

    fn on_server_data(&mut self, data: &mut FilterData<'_>) -> io::Result<()> {
        Self::substitute(data, &self.replace, &self.find);
        Ok(())
    }
}

/// Replaces every non-overlapping occurrence of `find`, returning `None`
/// when the input contains none.
fn replace_all(input: &[u8], find: &[u8], replace: &[u8]) -> Option<Vec<u8>> {
    if find.is_empty() || input.len() < find.len() {
        return None;
    }

    let mut output: Option<Vec<u8>> = None;
    let mut copied = 0;
    let mut at = 0;

    while at + find.len() <= input.len() {
        if &input[at..at + find.len()] == find {
            let out = output.get_or_insert_with(|| Vec::with_capacity(input.len()));
            out.extend_from_slice(&input[copied..at]);
            out.extend_from_slice(replace);
            at += find.len();
            copied = at;
        } else {
            at += 1;
        }
    }

    if let Some(out) = output.as_mut() {
        out.extend_from_slice(&input[copied..]);
    }
    output
}
