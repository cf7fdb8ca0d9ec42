use bson::Document;
use serde::Serialize;
use std::io::{Read, Write};

use crate::errors::DbError;

/// Per-call inputs to `Connection::execute`: the payload plus the stream endpoints blob commands use.
#[derive(Default)]
pub struct Params<'a> {
    pub(crate) data: Option<Document>,
    pub(crate) single_update: bool,
    pub(crate) source: Option<&'a mut dyn Read>,
    pub(crate) output: Option<&'a mut dyn Write>,
}

impl<'a> Params<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes `value` as the payload.
    pub fn data<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, DbError> {
        self.data = Some(bson::serialize_to_document(value)?);
        Ok(self)
    }

    /// Uses an already-built document as the payload.
    #[must_use]
    pub fn document(mut self, doc: Document) -> Self {
        self.data = Some(doc);
        self
    }

    /// Applies the payload to exactly one matching document, unfiltered by the update allow-list.
    #[must_use]
    pub fn single_update(mut self, single: bool) -> Self {
        self.single_update = single;
        self
    }

    /// Reader a blob write uploads from.
    #[must_use]
    pub fn source(mut self, reader: &'a mut dyn Read) -> Self {
        self.source = Some(reader);
        self
    }

    /// Writer a blob read copies into.
    #[must_use]
    pub fn output(mut self, writer: &'a mut dyn Write) -> Self {
        self.output = Some(writer);
        self
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Document> {
        self.data.as_ref()
    }
}
