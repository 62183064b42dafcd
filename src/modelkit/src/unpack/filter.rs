//! Layer selection for unpack.

use std::str::FromStr;

use kitops_core::error::{KitError, Result};

use crate::kitfile::{Code, Dataset, Docs, Model, ModelPart};
use crate::oci::BaseType;

/// One `<type1>,<type2>[:<id1>,<id2>]` filter. Ids match a layer's name or
/// path; without ids every layer of the listed types matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackFilter {
    pub base_types: Vec<BaseType>,
    pub ids: Vec<String>,
}

impl UnpackFilter {
    pub fn new(base_types: Vec<BaseType>) -> Self {
        Self {
            base_types,
            ids: Vec::new(),
        }
    }

    /// Filter selecting only model layers, used for parent ModelKits.
    pub fn model_only() -> Self {
        Self::new(vec![BaseType::Model])
    }

    fn matches(&self, base: BaseType, field: &str) -> bool {
        self.base_types.contains(&base) && (self.ids.is_empty() || self.ids.iter().any(|id| id == field))
    }
}

impl FromStr for UnpackFilter {
    type Err = KitError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            KitError::Other(format!(
                "invalid filter {}: should be in format <type1>,<type2>[:<filter1>,<filter2>]",
                s
            ))
        };
        let mut split = s.split(':');
        let types = split.next().ok_or_else(invalid)?;
        let ids = split.next();
        if split.next().is_some() {
            return Err(invalid());
        }

        let base_types = types
            .split(',')
            .map(filter_base_type)
            .collect::<Result<Vec<_>>>()?;
        let ids = ids
            .map(|ids| ids.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Self { base_types, ids })
    }
}

fn filter_base_type(name: &str) -> Result<BaseType> {
    match name {
        "kitfile" => Ok(BaseType::Config),
        "model" => Ok(BaseType::Model),
        "datasets" => Ok(BaseType::Dataset),
        "code" => Ok(BaseType::Code),
        "docs" => Ok(BaseType::Docs),
        other => Err(KitError::Other(format!(
            "invalid filter type {} (must be one of 'kitfile', 'model', 'datasets', 'code', or 'docs')",
            other
        ))),
    }
}

/// A Kitfile section that may be unpacked.
#[derive(Debug, Clone, Copy)]
pub enum Section<'a> {
    Kitfile,
    Model(&'a Model),
    ModelPart(&'a ModelPart),
    Code(&'a Code),
    Dataset(&'a Dataset),
    Docs(&'a Docs),
}

/// Whether `section` passes `filters`. No filters means everything unpacks.
/// Code and docs have no name and match on path only; model parts are
/// selected by the `model` type.
pub fn should_unpack(section: Section<'_>, filters: &[UnpackFilter]) -> bool {
    if filters.is_empty() {
        return true;
    }
    let any = |base: BaseType, fields: &[&str]| {
        filters
            .iter()
            .any(|f| fields.iter().any(|field| f.matches(base, field)))
    };
    match section {
        Section::Kitfile => filters
            .iter()
            .any(|f| f.base_types.contains(&BaseType::Config)),
        Section::Model(m) => any(BaseType::Model, &[m.name.as_str(), m.path.as_str()]),
        Section::ModelPart(p) => any(BaseType::Model, &[p.name.as_str(), p.path.as_str()]),
        Section::Code(c) => any(BaseType::Code, &[c.path.as_str()]),
        Section::Dataset(d) => any(BaseType::Dataset, &[d.name.as_str(), d.path.as_str()]),
        Section::Docs(d) => any(BaseType::Docs, &[d.path.as_str()]),
    }
}
