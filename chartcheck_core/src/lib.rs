#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde_yaml;
extern crate serde;

#[macro_use]
extern crate log;

#[macro_use]
extern crate error_chain;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {}
    foreign_links {
        Io(::std::io::Error);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
    }
    errors {
        InputMissing(what: String) {
            description("required input is missing")
            display("{}", what)
        }
        ExternalToolFailure(tool: String, output: String) {
            description("external tool invocation failed")
            display("{} failed: {}", tool, output)
        }
        ParseFailure(reason: String) {
            description("manifest document failed to parse")
            display("parse failure: {}", reason)
        }
        ManifestIo(path: String, reason: String) {
            description("filesystem error against a rendered manifest")
            display("{}: {}", path, reason)
        }
        ImageAbsent(image: String) {
            description("registry does not have the requested image")
            display("image not found in registry: {}", image)
        }
        Cancelled(what: String) {
            description("operation was cancelled")
            display("cancelled: {}", what)
        }
    }
}

/// Data types flowing between pipeline stages.
pub mod types;

/// Reads ApplicationSet-style YAML into a flat list of [`types::ChartSpec`].
pub mod discovery;

/// Abstracts invocation of the external template/schema/registry tools.
pub mod exec;

/// The four-stage render/validate/extract/verify pipeline and its Coordinator.
pub mod pipeline;
