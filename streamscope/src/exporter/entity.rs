use strum_macros::{Display, EnumIter};

const DOMAIN_LABELS: &[&str] = &["domain"];
const INSTANCE_LABELS: &[&str] = &["instance"];
const RESOURCE_LABELS: &[&str] = &["instance", "resource"];
const JOB_LABELS: &[&str] = &["instance", "job"];
const PE_LABELS: &[&str] = &["instance", "job", "resource", "pe"];
const PE_PORT_LABELS: &[&str] = &["instance", "job", "resource", "pe", "index"];
const PE_CONNECTION_LABELS: &[&str] = &["instance", "job", "resource", "pe", "index", "connection"];
const OPERATOR_LABELS: &[&str] = &["instance", "job", "resource", "pe", "operator"];
const OPERATOR_INPUT_PORT_LABELS: &[&str] = &["instance", "job", "resource", "pe", "operator", "input_port"];
const OPERATOR_OUTPUT_PORT_LABELS: &[&str] = &["instance", "job", "resource", "pe", "operator", "output_port"];

/// The kind of tracked entity an exported series describes.
///
/// Every entity below the domain is rooted at its instance, so removing the series under a label
/// prefix tears down an entity together with everything nested in it. A PE carries its resource
/// in its labels; a PE that relocates is exported under a fresh series.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Domain,
    Instance,
    Resource,
    Job,
    Pe,
    PeInputPort,
    PeOutputPort,
    PeConnection,
    Operator,
    OperatorInputPort,
    OperatorOutputPort,
}

impl EntityType {
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Instance => "instance",
            Self::Resource => "resource",
            Self::Job => "job",
            Self::Pe => "pe",
            Self::PeInputPort => "pe_input_port",
            Self::PeOutputPort => "pe_output_port",
            Self::PeConnection => "pe_connection",
            Self::Operator => "operator",
            Self::OperatorInputPort => "operator_input_port",
            Self::OperatorOutputPort => "operator_output_port",
        }
    }

    pub const fn label_names(&self) -> &'static [&'static str] {
        match self {
            Self::Domain => DOMAIN_LABELS,
            Self::Instance => INSTANCE_LABELS,
            Self::Resource => RESOURCE_LABELS,
            Self::Job => JOB_LABELS,
            Self::Pe => PE_LABELS,
            Self::PeInputPort | Self::PeOutputPort => PE_PORT_LABELS,
            Self::PeConnection => PE_CONNECTION_LABELS,
            Self::Operator => OPERATOR_LABELS,
            Self::OperatorInputPort => OPERATOR_INPUT_PORT_LABELS,
            Self::OperatorOutputPort => OPERATOR_OUTPUT_PORT_LABELS,
        }
    }

    /// Whether series of this entity are nested under the first `depth` labels of `ancestor`.
    pub fn is_nested_under(&self, ancestor: Self, depth: usize) -> bool {
        let ancestor_names = ancestor.label_names();
        let names = self.label_names();
        depth <= ancestor_names.len() && depth <= names.len() && names[..depth] == ancestor_names[..depth]
    }
}
