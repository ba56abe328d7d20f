//! YAML output of CRDs for the `crd` subcommand.
use std::io::Write;

use snafu::{ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize YAML"))]
    SerializeYaml { source: serde_yaml::Error },

    #[snafu(display("failed to write YAML document separator"))]
    WriteDocumentSeparator { source: std::io::Error },

    #[snafu(display("failed to write YAML to stdout"))]
    WriteToStdout { source: std::io::Error },

    #[snafu(display("failed to parse bytes as valid UTF-8 string"))]
    ParseUtf8Bytes { source: std::string::FromUtf8Error },
}

/// Serializes `value` as an explicit YAML document (with leading `---`).
pub fn serialize<T, W>(value: &T, mut writer: W) -> Result<()>
where
    T: serde::Serialize,
    W: Write,
{
    writer
        .write_all(b"---\n")
        .context(WriteDocumentSeparatorSnafu)?;
    let mut serializer = serde_yaml::Serializer::new(writer);
    serde_yaml::with::singleton_map_recursive::serialize(value, &mut serializer)
        .context(SerializeYamlSnafu)
}

/// YAML output for Kubernetes custom resources.
pub trait CustomResourceExt: kube::CustomResourceExt {
    /// The `CustomResourceDefinition` of `Self` as a YAML document.
    fn yaml_schema() -> Result<String> {
        let mut buffer = Vec::new();
        serialize(&Self::crd(), &mut buffer)?;
        String::from_utf8(buffer).context(ParseUtf8BytesSnafu)
    }

    /// Prints the `CustomResourceDefinition` of `Self` to [stdout](std::io::stdout).
    fn print_yaml_schema() -> Result<()> {
        let schema = Self::yaml_schema()?;
        std::io::stdout()
            .write_all(schema.as_bytes())
            .context(WriteToStdoutSnafu)
    }
}

impl<T> CustomResourceExt for T where T: kube::CustomResourceExt {}
