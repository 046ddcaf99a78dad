#![allow(non_snake_case)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;
extern crate quick_xml;

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
        Fmt(::std::fmt::Error);
        Io(::std::io::Error);
        Xml(quick_xml::DeError);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
    }
    errors {
        ParseError(msg: String) {
            description("manifest could not be parsed")
            display("parse error: {}", msg)
        }
        ValidationError(msg: String) {
            description("manifest does not satisfy its invariants")
            display("validation error: {}", msg)
        }
        ConfigError(msg: String) {
            description("coordinator configuration is invalid")
            display("config error: {}", msg)
        }
        UnknownTarget(key: String) {
            description("reference to a target that does not exist")
            display("target '{}' is not present in the infrastructure model", key)
        }
        UnknownService(key: String) {
            description("reference to a service that does not exist")
            display("service '{}' is not present in the services table", key)
        }
        UnknownContainer(target: String, container: String) {
            description("reference to a container that is hosted by neither a target nor a service")
            display("container '{}' is not provided by target '{}' or by any service", container, target)
        }
        DuplicateKey(kind: String, key: String) {
            description("duplicate key within a keyed collection")
            display("duplicate {} key: {}", kind, key)
        }
    }
}

/// Target machines: properties, containers and the CPU-core budget semaphore
pub mod target;
pub use target::Target;

/// Services, inter-dependency mappings and the containers they provide
pub mod service;
pub use service::{InterDependencyMapping, ManifestService};

/// Service- and snapshot-mappings and their runtime status
pub mod mapping;
pub use mapping::{MappingStatus, ServiceMapping, SnapshotMapping};

/// Generic set algebra over keyed, sorted sequences
pub mod setalgebra;

/// The manifest aggregate: parsing, validation, the two surface forms
pub mod manifest;
pub use manifest::{LoadFlags, Manifest};

/// The XML wire format (canonical persisted form) and its declarative-syntax twin
pub mod xml;

/// Recursive-descent parser/printer for the declarative attribute-set surface form
mod nix_format;

/// Ambient coordinator configuration: state dir, profile name, transfer concurrency
pub mod config;
pub use config::CoordinatorConfig;

/// Typed property values used in target/container property tables
pub mod property;
pub use property::PropertyValue;
