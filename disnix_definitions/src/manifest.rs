//! The manifest aggregate (C1): parsing, validation and the two surface
//! forms (canonical XML, and the declarative attribute-set syntax consumed
//! by the expression evaluator).
//!
//! Grounded on `src/libmanifest/manifest.c` and `src/convert-manifest/*` in
//! the original implementation, which build the manifest by running libxml2
//! XPath queries over a normalized document. Here the same shape is parsed
//! directly off a `quick_xml::Reader` event stream (§6), since XPath has no
//! idiomatic Rust equivalent in this crate's dependency stack and the
//! document shape is simple enough for a single top-to-bottom walk.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::mapping::{MappingStatus, ServiceMapping, SnapshotMapping};
use crate::property::PropertyValue;
use crate::service::{InterDependencyMapping, ManifestService};
use crate::target::Target;
use crate::xml;
use crate::{nix_format, ErrorKind, Result};

bitflags::bitflags! {
    /// Selects which sub-trees `Manifest::load` populates (§4.1).
    pub struct LoadFlags: u8 {
        const DISTRIBUTION      = 0b0000_0001;
        const SERVICES          = 0b0000_0010;
        const SERVICE_MAPPINGS  = 0b0000_0100;
        const SNAPSHOT_MAPPINGS = 0b0000_1000;
        const INFRASTRUCTURE    = 0b0001_0000;
        const ALL = Self::DISTRIBUTION.bits
            | Self::SERVICES.bits
            | Self::SERVICE_MAPPINGS.bits
            | Self::SNAPSHOT_MAPPINGS.bits
            | Self::INFRASTRUCTURE.bits;
    }
}

/// The full deployment state: services, their placements, their
/// state-migration rules and the set of targets (§3).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub services: BTreeMap<String, ManifestService>,
    pub service_mapping_array: Vec<ServiceMapping>,
    pub snapshot_mapping_array: Vec<SnapshotMapping>,
    pub profile_mapping_table: BTreeMap<String, String>,
    pub targets_table: BTreeMap<String, Target>,
}

impl Manifest {
    /// Parses a manifest from an XML file, populating only the sub-trees
    /// selected by `flags`. `container_filter`/`component_filter` restrict
    /// snapshot mappings to a single container and/or component.
    pub fn load(
        path: &Path,
        flags: LoadFlags,
        container_filter: Option<&str>,
        component_filter: Option<&str>,
    ) -> Result<Manifest> {
        let data = fs::read_to_string(path)
            .map_err(|e| ErrorKind::ParseError(format!("cannot read manifest '{}': {}", path.display(), e)))?;
        Self::parse_xml_str(&data, flags, container_filter, component_filter)
    }

    /// Parses a manifest from an in-memory XML document. Separated from
    /// `load` so tests and the round-trip property checks don't need a
    /// filesystem.
    pub fn parse_xml_str(
        src: &str,
        flags: LoadFlags,
        container_filter: Option<&str>,
        component_filter: Option<&str>,
    ) -> Result<Manifest> {
        let mut reader = Reader::from_str(src);
        reader.trim_text(true);
        let mut buf = Vec::new();
        let mut m = Manifest::default();

        // consume up to and including the root element's start tag
        loop {
            buf.clear();
            match reader
                .read_event(&mut buf)
                .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
            {
                Event::Start(_) => break,
                Event::Eof => return Err(ErrorKind::ParseError("empty manifest document".into()).into()),
                _ => {}
            }
        }

        loop {
            buf.clear();
            match reader
                .read_event(&mut buf)
                .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
            {
                Event::Start(ref e) => {
                    let name = e.name().to_vec();
                    match name.as_slice() {
                        b"services" if flags.contains(LoadFlags::SERVICES) => {
                            m.services = parse_services(&mut reader, &mut buf)?;
                        }
                        b"serviceMappings" if flags.contains(LoadFlags::SERVICE_MAPPINGS) => {
                            m.service_mapping_array = parse_service_mappings(&mut reader, &mut buf)?;
                        }
                        b"snapshotMappings" if flags.contains(LoadFlags::SNAPSHOT_MAPPINGS) => {
                            m.snapshot_mapping_array =
                                parse_snapshot_mappings(&mut reader, &mut buf, container_filter, component_filter)?;
                        }
                        b"profiles" if flags.contains(LoadFlags::DISTRIBUTION) => {
                            m.profile_mapping_table = parse_profiles(&mut reader, &mut buf)?;
                        }
                        b"infrastructure" if flags.contains(LoadFlags::INFRASTRUCTURE) => {
                            m.targets_table = parse_infrastructure(&mut reader, &mut buf)?;
                        }
                        _ => xml::skip_element(&mut reader, &mut buf)?,
                    }
                }
                Event::End(_) => break,
                Event::Eof => break,
                _ => {}
            }
        }

        m.service_mapping_array.sort();
        m.snapshot_mapping_array.sort();
        Ok(m)
    }

    /// Parses the declarative attribute-set surface form (§6). Structurally
    /// identical to the XML form; used for the parse/print round-trip and by
    /// tooling that reads the expression evaluator's output directly.
    pub fn parse_nix_str(src: &str) -> Result<Manifest> {
        let value = nix_format::parse(src)?;
        let root = match value {
            PropertyValue::Attrs(m) => m,
            _ => return Err(ErrorKind::ParseError("manifest expression must be an attribute set".into()).into()),
        };
        let mut m = Manifest::default();

        if let Some(PropertyValue::Attrs(services)) = root.get("services") {
            for (name, v) in services {
                m.services.insert(name.clone(), manifest_service_from_nix(name, v)?);
            }
        }
        if let Some(PropertyValue::List(mappings)) = root.get("serviceMappings") {
            for v in mappings {
                m.service_mapping_array.push(service_mapping_from_nix(v)?);
            }
        }
        if let Some(PropertyValue::List(mappings)) = root.get("snapshotMappings") {
            for v in mappings {
                m.snapshot_mapping_array.push(snapshot_mapping_from_nix(v)?);
            }
        }
        if let Some(PropertyValue::Attrs(profiles)) = root.get("profiles") {
            for (k, v) in profiles {
                m.profile_mapping_table.insert(k.clone(), v.as_env_value());
            }
        }
        if let Some(PropertyValue::Attrs(targets)) = root.get("infrastructure") {
            for (key, v) in targets {
                m.targets_table.insert(key.clone(), target_from_nix(v)?);
            }
        }

        m.service_mapping_array.sort();
        m.snapshot_mapping_array.sort();
        Ok(m)
    }

    /// Enforces the §3 cross-reference invariants. Per-entity structural
    /// invariants (required fields etc.) are enforced as each piece parses;
    /// this pass checks that every reference resolves within the manifest.
    pub fn validate(&self) -> Result<()> {
        for target in self.targets_table.values() {
            target.validate()?;
        }
        for svc in self.services.values() {
            svc.validate()?;
        }

        for m in &self.service_mapping_array {
            if !self.services.contains_key(&m.service) {
                return Err(ErrorKind::UnknownService(m.service.clone()).into());
            }
            if !self.targets_table.contains_key(&m.target) {
                return Err(ErrorKind::UnknownTarget(m.target.clone()).into());
            }
            self.validate_container(&m.target, &m.container, m.container_provided_by_service.as_deref())?;
        }

        for m in &self.snapshot_mapping_array {
            if !self.services.contains_key(&m.service) {
                return Err(ErrorKind::UnknownService(m.service.clone()).into());
            }
            if !self.targets_table.contains_key(&m.target) {
                return Err(ErrorKind::UnknownTarget(m.target.clone()).into());
            }
            self.validate_container(&m.target, &m.container, m.container_provided_by_service.as_deref())?;
        }

        for target_key in self.profile_mapping_table.keys() {
            if !self.targets_table.contains_key(target_key) {
                return Err(ErrorKind::UnknownTarget(target_key.clone()).into());
            }
        }

        for svc in self.services.values() {
            for dep in svc.depends_on.iter().chain(svc.connects_to.iter()) {
                if !self.services.contains_key(&dep.service) {
                    return Err(ErrorKind::UnknownService(dep.service.clone()).into());
                }
            }
        }

        Ok(())
    }

    fn validate_container(&self, target: &str, container: &str, provided_by: Option<&str>) -> Result<()> {
        if let Some(provider) = provided_by {
            let svc = self
                .services
                .get(provider)
                .ok_or_else(|| ErrorKind::UnknownService(provider.to_string()))?;
            if svc.provides_containers.contains_key(container) {
                return Ok(());
            }
            return Err(ErrorKind::UnknownContainer(target.to_string(), container.to_string()).into());
        }
        if let Some(t) = self.targets_table.get(target) {
            if t.containers.contains_key(container) {
                return Ok(());
            }
        }
        Err(ErrorKind::UnknownContainer(target.to_string(), container.to_string()).into())
    }

    /// Emits the canonical XML surface form.
    pub fn print_xml(&self, out: &mut dyn Write) -> Result<()> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Start(BytesStart::borrowed_name(b"manifest")))
            .map_err(xml_write_err)?;

        writer
            .write_event(Event::Start(BytesStart::borrowed_name(b"services")))
            .map_err(xml_write_err)?;
        for (name, svc) in &self.services {
            write_service_xml(&mut writer, name, svc)?;
        }
        writer
            .write_event(Event::End(BytesEnd::borrowed(b"services")))
            .map_err(xml_write_err)?;

        writer
            .write_event(Event::Start(BytesStart::borrowed_name(b"serviceMappings")))
            .map_err(xml_write_err)?;
        for m in &self.service_mapping_array {
            write_service_mapping_xml(&mut writer, m)?;
        }
        writer
            .write_event(Event::End(BytesEnd::borrowed(b"serviceMappings")))
            .map_err(xml_write_err)?;

        writer
            .write_event(Event::Start(BytesStart::borrowed_name(b"snapshotMappings")))
            .map_err(xml_write_err)?;
        for m in &self.snapshot_mapping_array {
            write_snapshot_mapping_xml(&mut writer, m)?;
        }
        writer
            .write_event(Event::End(BytesEnd::borrowed(b"snapshotMappings")))
            .map_err(xml_write_err)?;

        writer
            .write_event(Event::Start(BytesStart::borrowed_name(b"profiles")))
            .map_err(xml_write_err)?;
        for (target, path) in &self.profile_mapping_table {
            let mut start = BytesStart::owned_name("profile");
            start.push_attribute(("name", target.as_str()));
            writer.write_event(Event::Start(start)).map_err(xml_write_err)?;
            writer
                .write_event(Event::Text(quick_xml::events::BytesText::from_plain_str(path)))
                .map_err(xml_write_err)?;
            writer
                .write_event(Event::End(BytesEnd::borrowed(b"profile")))
                .map_err(xml_write_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::borrowed(b"profiles")))
            .map_err(xml_write_err)?;

        writer
            .write_event(Event::Start(BytesStart::borrowed_name(b"infrastructure")))
            .map_err(xml_write_err)?;
        for (key, target) in &self.targets_table {
            write_target_xml(&mut writer, key, target)?;
        }
        writer
            .write_event(Event::End(BytesEnd::borrowed(b"infrastructure")))
            .map_err(xml_write_err)?;

        writer
            .write_event(Event::End(BytesEnd::borrowed(b"manifest")))
            .map_err(xml_write_err)?;

        out.write_all(&writer.into_inner())
            .map_err(|e| ErrorKind::ParseError(format!("cannot write manifest: {}", e)))?;
        Ok(())
    }

    /// Emits the equivalent declarative attribute-set form for the
    /// expression evaluator.
    pub fn print_nix(&self, out: &mut dyn Write) -> Result<()> {
        let value = self.to_nix_value();
        writeln!(out, "{}", value.to_nix())
            .map_err(|e| ErrorKind::ParseError(format!("cannot write manifest: {}", e)))?;
        Ok(())
    }

    fn to_nix_value(&self) -> PropertyValue {
        let mut root = BTreeMap::new();

        let mut services = BTreeMap::new();
        for (name, svc) in &self.services {
            let mut s = BTreeMap::new();
            s.insert("pkg".into(), PropertyValue::String(svc.pkg.clone()));
            s.insert("type".into(), PropertyValue::String(svc.service_type.clone()));
            s.insert(
                "dependsOn".into(),
                PropertyValue::List(svc.depends_on.iter().map(inter_dep_to_nix).collect()),
            );
            s.insert(
                "connectsTo".into(),
                PropertyValue::List(svc.connects_to.iter().map(inter_dep_to_nix).collect()),
            );
            let mut provides = BTreeMap::new();
            for (cname, props) in &svc.provides_containers {
                provides.insert(cname.clone(), PropertyValue::Attrs(props.clone()));
            }
            s.insert("providesContainers".into(), PropertyValue::Attrs(provides));
            services.insert(name.clone(), PropertyValue::Attrs(s));
        }
        root.insert("services".into(), PropertyValue::Attrs(services));

        root.insert(
            "serviceMappings".into(),
            PropertyValue::List(self.service_mapping_array.iter().map(service_mapping_to_nix).collect()),
        );
        root.insert(
            "snapshotMappings".into(),
            PropertyValue::List(
                self.snapshot_mapping_array
                    .iter()
                    .map(snapshot_mapping_to_nix)
                    .collect(),
            ),
        );

        let mut profiles = BTreeMap::new();
        for (target, path) in &self.profile_mapping_table {
            profiles.insert(target.clone(), PropertyValue::String(path.clone()));
        }
        root.insert("profiles".into(), PropertyValue::Attrs(profiles));

        let mut infra = BTreeMap::new();
        for (key, target) in &self.targets_table {
            infra.insert(key.clone(), target_to_nix(target));
        }
        root.insert("infrastructure".into(), PropertyValue::Attrs(infra));

        PropertyValue::Attrs(root)
    }

    /// Resolves the prior manifest: an explicit `path` wins; otherwise the
    /// coordinator profile is consulted. A missing coordinator profile is
    /// treated as "no previous manifest" (fresh install), not an error.
    pub fn open_provided_or_previous(
        path: Option<&Path>,
        coordinator_profile_path: Option<&Path>,
        profile: &str,
    ) -> Result<Option<Manifest>> {
        if let Some(p) = path {
            return Ok(Some(Manifest::load(p, LoadFlags::ALL, None, None)?));
        }
        let base = coordinator_profile_path
            .map(Path::to_path_buf)
            .unwrap_or_else(crate::config::CoordinatorConfig::default_state_dir);
        let link = base.join(profile);
        match fs::read_link(&link) {
            Ok(target) => {
                let manifest_path = resolve_one_indirection(&link, &target);
                Ok(Some(Manifest::load(&manifest_path, LoadFlags::ALL, None, None)?))
            }
            Err(_) => Ok(None),
        }
    }
}

fn resolve_one_indirection(link: &Path, target: &Path) -> PathBuf {
    let resolved = if target.is_relative() {
        link.parent().unwrap_or_else(|| Path::new(".")).join(target)
    } else {
        target.to_path_buf()
    };
    match fs::read_link(&resolved) {
        Ok(indirect) if indirect.is_relative() => resolved
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(indirect),
        Ok(indirect) => indirect,
        Err(_) => resolved,
    }
}

fn xml_write_err(e: std::io::Error) -> crate::Error {
    ErrorKind::ParseError(format!("xml write error: {}", e)).into()
}

// ---------------------------------------------------------------------
// XML parsing helpers
// ---------------------------------------------------------------------

fn parse_services(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<BTreeMap<String, ManifestService>> {
    let mut out = BTreeMap::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) if e.name() == b"service" => {
                let name = xml::required_attr(e, "name")?;
                let svc = parse_service(reader, buf, &name)?;
                if out.insert(name.clone(), svc).is_some() {
                    return Err(ErrorKind::DuplicateKey("service".into(), name).into());
                }
            }
            Event::End(_) => return Ok(out),
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside <services>".into()).into()),
            _ => {}
        }
    }
}

fn parse_service(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>, name: &str) -> Result<ManifestService> {
    let mut svc = ManifestService {
        name: name.to_string(),
        pkg: String::new(),
        service_type: String::new(),
        depends_on: Vec::new(),
        connects_to: Vec::new(),
        provides_containers: BTreeMap::new(),
    };
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) => match e.name() {
                b"pkg" => svc.pkg = xml::read_leaf_text(reader, buf)?,
                b"type" => svc.service_type = xml::read_leaf_text(reader, buf)?,
                b"name" => {
                    xml::read_leaf_text(reader, buf)?; // redundant with the attribute; ignored
                }
                b"dependsOn" => svc.depends_on = parse_mapping_list(reader, buf)?,
                b"connectsTo" => svc.connects_to = parse_mapping_list(reader, buf)?,
                b"providesContainers" => svc.provides_containers = parse_containers_map(reader, buf)?,
                _ => xml::skip_element(reader, buf)?,
            },
            Event::End(_) => return Ok(svc),
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside <service>".into()).into()),
            _ => {}
        }
    }
}

fn parse_mapping_list(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<Vec<InterDependencyMapping>> {
    let mut out = Vec::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) if e.name() == b"mapping" => {
                out.push(parse_inter_dependency_mapping(reader, buf)?);
            }
            Event::End(_) => return Ok(out),
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside mapping list".into()).into()),
            _ => {}
        }
    }
}

fn parse_inter_dependency_mapping(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<InterDependencyMapping> {
    let mut service = String::new();
    let mut container = String::new();
    let mut target = String::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) => match e.name() {
                b"service" => service = xml::read_leaf_text(reader, buf)?,
                b"container" => container = xml::read_leaf_text(reader, buf)?,
                b"target" => target = xml::read_leaf_text(reader, buf)?,
                _ => xml::skip_element(reader, buf)?,
            },
            Event::End(_) => {
                return Ok(InterDependencyMapping { service, container, target });
            }
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside <mapping>".into()).into()),
            _ => {}
        }
    }
}

fn parse_containers_map(
    reader: &mut Reader<&[u8]>,
    buf: &mut Vec<u8>,
) -> Result<BTreeMap<String, BTreeMap<String, PropertyValue>>> {
    let mut out = BTreeMap::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) if e.name() == b"container" => {
                let name = xml::required_attr(e, "name")?;
                let props = xml::read_property_map(reader, buf)?;
                if out.insert(name.clone(), props).is_some() {
                    return Err(ErrorKind::DuplicateKey("container".into(), name).into());
                }
            }
            Event::End(_) => return Ok(out),
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside container map".into()).into()),
            _ => {}
        }
    }
}

fn parse_service_mappings(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<Vec<ServiceMapping>> {
    let mut out = Vec::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) if e.name() == b"mapping" => {
                out.push(parse_service_mapping(reader, buf)?);
            }
            Event::End(_) => return Ok(out),
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside <serviceMappings>".into()).into()),
            _ => {}
        }
    }
}

fn parse_service_mapping(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<ServiceMapping> {
    let mut service = String::new();
    let mut container = String::new();
    let mut target = String::new();
    let mut provided_by = None;
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) => match e.name() {
                b"service" => service = xml::read_leaf_text(reader, buf)?,
                b"container" => container = xml::read_leaf_text(reader, buf)?,
                b"target" => target = xml::read_leaf_text(reader, buf)?,
                b"containerProvidedByService" => provided_by = Some(xml::read_leaf_text(reader, buf)?),
                _ => xml::skip_element(reader, buf)?,
            },
            Event::End(_) => {
                if service.is_empty() || container.is_empty() || target.is_empty() {
                    return Err(ErrorKind::ValidationError(
                        "service mapping must set service, container and target".into(),
                    )
                    .into());
                }
                return Ok(ServiceMapping {
                    service,
                    container,
                    target,
                    container_provided_by_service: provided_by,
                    status: MappingStatus::Deactivated,
                });
            }
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside service mapping".into()).into()),
            _ => {}
        }
    }
}

fn parse_snapshot_mappings(
    reader: &mut Reader<&[u8]>,
    buf: &mut Vec<u8>,
    container_filter: Option<&str>,
    component_filter: Option<&str>,
) -> Result<Vec<SnapshotMapping>> {
    let mut out = Vec::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) if e.name() == b"mapping" => {
                let m = parse_snapshot_mapping(reader, buf)?;
                let container_ok = container_filter.map_or(true, |c| c == m.container);
                let component_ok = component_filter.map_or(true, |c| c == m.component);
                if container_ok && component_ok {
                    out.push(m);
                }
            }
            Event::End(_) => return Ok(out),
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside <snapshotMappings>".into()).into()),
            _ => {}
        }
    }
}

fn parse_snapshot_mapping(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<SnapshotMapping> {
    let mut component = String::new();
    let mut container = String::new();
    let mut target = String::new();
    let mut service = String::new();
    let mut provided_by = None;
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) => match e.name() {
                b"component" => component = xml::read_leaf_text(reader, buf)?,
                b"container" => container = xml::read_leaf_text(reader, buf)?,
                b"target" => target = xml::read_leaf_text(reader, buf)?,
                b"service" => service = xml::read_leaf_text(reader, buf)?,
                b"containerProvidedByService" => provided_by = Some(xml::read_leaf_text(reader, buf)?),
                _ => xml::skip_element(reader, buf)?,
            },
            Event::End(_) => {
                if component.is_empty() || container.is_empty() || target.is_empty() || service.is_empty() {
                    return Err(ErrorKind::ValidationError(
                        "snapshot mapping must set component, container, target and service".into(),
                    )
                    .into());
                }
                return Ok(SnapshotMapping {
                    component,
                    container,
                    target,
                    service,
                    container_provided_by_service: provided_by,
                    transferred: false,
                });
            }
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside snapshot mapping".into()).into()),
            _ => {}
        }
    }
}

fn parse_profiles(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) if e.name() == b"profile" => {
                let name = xml::required_attr(e, "name")?;
                let path = xml::read_leaf_text(reader, buf)?;
                if out.insert(name.clone(), path).is_some() {
                    return Err(ErrorKind::DuplicateKey("profile".into(), name).into());
                }
            }
            Event::End(_) => return Ok(out),
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside <profiles>".into()).into()),
            _ => {}
        }
    }
}

fn parse_infrastructure(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<BTreeMap<String, Target>> {
    let mut out = BTreeMap::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) if e.name() == b"target" => {
                let key = xml::required_attr(e, "name")?;
                let t = parse_target(reader, buf)?;
                if out.insert(key.clone(), t).is_some() {
                    return Err(ErrorKind::DuplicateKey("target".into(), key).into());
                }
            }
            Event::End(_) => return Ok(out),
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside <infrastructure>".into()).into()),
            _ => {}
        }
    }
}

fn parse_target(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<Target> {
    let mut system = String::new();
    let mut client_interface = String::new();
    let mut target_property = String::new();
    let mut num_of_cores = 1u32;
    let mut properties = BTreeMap::new();
    let mut containers = BTreeMap::new();
    loop {
        buf.clear();
        match reader
            .read_event(buf)
            .map_err(|e| ErrorKind::ParseError(format!("xml read error: {}", e)))?
        {
            Event::Start(ref e) => match e.name() {
                b"system" => system = xml::read_leaf_text(reader, buf)?,
                b"clientInterface" => client_interface = xml::read_leaf_text(reader, buf)?,
                b"targetProperty" => target_property = xml::read_leaf_text(reader, buf)?,
                b"numOfCores" => {
                    let text = xml::read_leaf_text(reader, buf)?;
                    num_of_cores = text
                        .parse()
                        .map_err(|_| ErrorKind::ParseError(format!("'{}' is not a valid numOfCores", text)))?;
                }
                b"properties" => properties = xml::read_property_map(reader, buf)?,
                b"containers" => containers = parse_containers_map(reader, buf)?,
                _ => xml::skip_element(reader, buf)?,
            },
            Event::End(_) => {
                return Ok(Target::new(
                    system,
                    client_interface,
                    target_property,
                    properties,
                    containers,
                    num_of_cores,
                ))
            }
            Event::Eof => return Err(ErrorKind::ParseError("unexpected eof inside <target>".into()).into()),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------
// XML writing helpers
// ---------------------------------------------------------------------

fn write_service_xml(writer: &mut Writer<Vec<u8>>, name: &str, svc: &ManifestService) -> Result<()> {
    let mut start = BytesStart::owned_name("service");
    start.push_attribute(("name", name));
    writer.write_event(Event::Start(start)).map_err(xml_write_err)?;
    xml::write_leaf(writer, "pkg", &svc.pkg)?;
    xml::write_leaf(writer, "type", &svc.service_type)?;

    writer
        .write_event(Event::Start(BytesStart::borrowed_name(b"dependsOn")))
        .map_err(xml_write_err)?;
    for d in &svc.depends_on {
        write_inter_dependency_mapping_xml(writer, d)?;
    }
    writer
        .write_event(Event::End(BytesEnd::borrowed(b"dependsOn")))
        .map_err(xml_write_err)?;

    writer
        .write_event(Event::Start(BytesStart::borrowed_name(b"connectsTo")))
        .map_err(xml_write_err)?;
    for d in &svc.connects_to {
        write_inter_dependency_mapping_xml(writer, d)?;
    }
    writer
        .write_event(Event::End(BytesEnd::borrowed(b"connectsTo")))
        .map_err(xml_write_err)?;

    writer
        .write_event(Event::Start(BytesStart::borrowed_name(b"providesContainers")))
        .map_err(xml_write_err)?;
    for (cname, props) in &svc.provides_containers {
        let mut cstart = BytesStart::owned_name("container");
        cstart.push_attribute(("name", cname.as_str()));
        writer.write_event(Event::Start(cstart)).map_err(xml_write_err)?;
        for (k, v) in props {
            xml::write_property(writer, k, v)?;
        }
        writer
            .write_event(Event::End(BytesEnd::borrowed(b"container")))
            .map_err(xml_write_err)?;
    }
    writer
        .write_event(Event::End(BytesEnd::borrowed(b"providesContainers")))
        .map_err(xml_write_err)?;

    writer
        .write_event(Event::End(BytesEnd::borrowed(b"service")))
        .map_err(xml_write_err)?;
    Ok(())
}

fn write_inter_dependency_mapping_xml(writer: &mut Writer<Vec<u8>>, d: &InterDependencyMapping) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::borrowed_name(b"mapping")))
        .map_err(xml_write_err)?;
    xml::write_leaf(writer, "service", &d.service)?;
    xml::write_leaf(writer, "container", &d.container)?;
    xml::write_leaf(writer, "target", &d.target)?;
    writer
        .write_event(Event::End(BytesEnd::borrowed(b"mapping")))
        .map_err(xml_write_err)?;
    Ok(())
}

fn write_service_mapping_xml(writer: &mut Writer<Vec<u8>>, m: &ServiceMapping) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::borrowed_name(b"mapping")))
        .map_err(xml_write_err)?;
    xml::write_leaf(writer, "service", &m.service)?;
    xml::write_leaf(writer, "container", &m.container)?;
    xml::write_leaf(writer, "target", &m.target)?;
    if let Some(ref p) = m.container_provided_by_service {
        xml::write_leaf(writer, "containerProvidedByService", p)?;
    }
    writer
        .write_event(Event::End(BytesEnd::borrowed(b"mapping")))
        .map_err(xml_write_err)?;
    Ok(())
}

fn write_snapshot_mapping_xml(writer: &mut Writer<Vec<u8>>, m: &SnapshotMapping) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::borrowed_name(b"mapping")))
        .map_err(xml_write_err)?;
    xml::write_leaf(writer, "component", &m.component)?;
    xml::write_leaf(writer, "container", &m.container)?;
    xml::write_leaf(writer, "target", &m.target)?;
    xml::write_leaf(writer, "service", &m.service)?;
    if let Some(ref p) = m.container_provided_by_service {
        xml::write_leaf(writer, "containerProvidedByService", p)?;
    }
    writer
        .write_event(Event::End(BytesEnd::borrowed(b"mapping")))
        .map_err(xml_write_err)?;
    Ok(())
}

fn write_target_xml(writer: &mut Writer<Vec<u8>>, key: &str, target: &Target) -> Result<()> {
    let mut start = BytesStart::owned_name("target");
    start.push_attribute(("name", key));
    writer.write_event(Event::Start(start)).map_err(xml_write_err)?;
    xml::write_leaf(writer, "system", &target.system)?;
    xml::write_leaf(writer, "clientInterface", &target.client_interface)?;
    xml::write_leaf(writer, "targetProperty", &target.target_property)?;
    xml::write_leaf(writer, "numOfCores", &target.num_of_cores.to_string())?;
    xml::write_property_map(writer, "properties", &target.properties)?;

    writer
        .write_event(Event::Start(BytesStart::borrowed_name(b"containers")))
        .map_err(xml_write_err)?;
    for (cname, props) in &target.containers {
        let mut cstart = BytesStart::owned_name("container");
        cstart.push_attribute(("name", cname.as_str()));
        writer.write_event(Event::Start(cstart)).map_err(xml_write_err)?;
        for (k, v) in props {
            xml::write_property(writer, k, v)?;
        }
        writer
            .write_event(Event::End(BytesEnd::borrowed(b"container")))
            .map_err(xml_write_err)?;
    }
    writer
        .write_event(Event::End(BytesEnd::borrowed(b"containers")))
        .map_err(xml_write_err)?;

    writer
        .write_event(Event::End(BytesEnd::borrowed(b"target")))
        .map_err(xml_write_err)?;
    Ok(())
}

// ---------------------------------------------------------------------
// Nix attribute-set conversion helpers
// ---------------------------------------------------------------------

fn inter_dep_to_nix(d: &InterDependencyMapping) -> PropertyValue {
    let mut m = BTreeMap::new();
    m.insert("service".into(), PropertyValue::String(d.service.clone()));
    m.insert("container".into(), PropertyValue::String(d.container.clone()));
    m.insert("target".into(), PropertyValue::String(d.target.clone()));
    PropertyValue::Attrs(m)
}

fn inter_dep_from_nix(v: &PropertyValue) -> Result<InterDependencyMapping> {
    let m = as_attrs(v)?;
    Ok(InterDependencyMapping {
        service: get_string(m, "service")?,
        container: get_string(m, "container")?,
        target: get_string(m, "target")?,
    })
}

fn service_mapping_to_nix(m: &ServiceMapping) -> PropertyValue {
    let mut out = BTreeMap::new();
    out.insert("service".into(), PropertyValue::String(m.service.clone()));
    out.insert("container".into(), PropertyValue::String(m.container.clone()));
    out.insert("target".into(), PropertyValue::String(m.target.clone()));
    if let Some(ref p) = m.container_provided_by_service {
        out.insert("containerProvidedByService".into(), PropertyValue::String(p.clone()));
    }
    PropertyValue::Attrs(out)
}

fn service_mapping_from_nix(v: &PropertyValue) -> Result<ServiceMapping> {
    let m = as_attrs(v)?;
    Ok(ServiceMapping {
        service: get_string(m, "service")?,
        container: get_string(m, "container")?,
        target: get_string(m, "target")?,
        container_provided_by_service: m.get("containerProvidedByService").map(PropertyValue::as_env_value),
        status: MappingStatus::Deactivated,
    })
}

fn snapshot_mapping_to_nix(m: &SnapshotMapping) -> PropertyValue {
    let mut out = BTreeMap::new();
    out.insert("component".into(), PropertyValue::String(m.component.clone()));
    out.insert("container".into(), PropertyValue::String(m.container.clone()));
    out.insert("target".into(), PropertyValue::String(m.target.clone()));
    out.insert("service".into(), PropertyValue::String(m.service.clone()));
    if let Some(ref p) = m.container_provided_by_service {
        out.insert("containerProvidedByService".into(), PropertyValue::String(p.clone()));
    }
    PropertyValue::Attrs(out)
}

fn snapshot_mapping_from_nix(v: &PropertyValue) -> Result<SnapshotMapping> {
    let m = as_attrs(v)?;
    Ok(SnapshotMapping {
        component: get_string(m, "component")?,
        container: get_string(m, "container")?,
        target: get_string(m, "target")?,
        service: get_string(m, "service")?,
        container_provided_by_service: m.get("containerProvidedByService").map(PropertyValue::as_env_value),
        transferred: false,
    })
}

fn target_to_nix(t: &Target) -> PropertyValue {
    let mut m = BTreeMap::new();
    m.insert("system".into(), PropertyValue::String(t.system.clone()));
    m.insert("clientInterface".into(), PropertyValue::String(t.client_interface.clone()));
    m.insert("targetProperty".into(), PropertyValue::String(t.target_property.clone()));
    m.insert("numOfCores".into(), PropertyValue::Int(t.num_of_cores as i64));
    m.insert("properties".into(), PropertyValue::Attrs(t.properties.clone()));
    let mut containers = BTreeMap::new();
    for (k, v) in &t.containers {
        containers.insert(k.clone(), PropertyValue::Attrs(v.clone()));
    }
    m.insert("containers".into(), PropertyValue::Attrs(containers));
    PropertyValue::Attrs(m)
}

fn target_from_nix(v: &PropertyValue) -> Result<Target> {
    let m = as_attrs(v)?;
    let properties = match m.get("properties") {
        Some(PropertyValue::Attrs(p)) => p.clone(),
        _ => BTreeMap::new(),
    };
    let mut containers = BTreeMap::new();
    if let Some(PropertyValue::Attrs(cs)) = m.get("containers") {
        for (k, v) in cs {
            containers.insert(k.clone(), as_attrs(v)?.clone());
        }
    }
    let num_of_cores = match m.get("numOfCores") {
        Some(PropertyValue::Int(n)) => *n as u32,
        _ => 1,
    };
    Ok(Target::new(
        get_string(m, "system")?,
        get_string(m, "clientInterface")?,
        get_string(m, "targetProperty")?,
        properties,
        containers,
        num_of_cores,
    ))
}

fn manifest_service_from_nix(name: &str, v: &PropertyValue) -> Result<ManifestService> {
    let m = as_attrs(v)?;
    let depends_on = match m.get("dependsOn") {
        Some(PropertyValue::List(xs)) => xs.iter().map(inter_dep_from_nix).collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };
    let connects_to = match m.get("connectsTo") {
        Some(PropertyValue::List(xs)) => xs.iter().map(inter_dep_from_nix).collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };
    let mut provides_containers = BTreeMap::new();
    if let Some(PropertyValue::Attrs(cs)) = m.get("providesContainers") {
        for (k, v) in cs {
            provides_containers.insert(k.clone(), as_attrs(v)?.clone());
        }
    }
    Ok(ManifestService {
        name: name.to_string(),
        pkg: get_string(m, "pkg")?,
        service_type: get_string(m, "type")?,
        depends_on,
        connects_to,
        provides_containers,
    })
}

fn as_attrs(v: &PropertyValue) -> Result<&BTreeMap<String, PropertyValue>> {
    match v {
        PropertyValue::Attrs(m) => Ok(m),
        _ => Err(ErrorKind::ParseError("expected an attribute set".into()).into()),
    }
}

fn get_string(m: &BTreeMap<String, PropertyValue>, key: &str) -> Result<String> {
    m.get(key)
        .map(PropertyValue::as_env_value)
        .ok_or_else(|| ErrorKind::ParseError(format!("missing required attribute '{}'", key)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn sample_manifest() -> Manifest {
        let mut m = Manifest::default();
        m.targets_table.insert(
            "T1".into(),
            Target::new(
                "x86_64-linux".into(),
                "disnix-ssh-client".into(),
                "hostname".into(),
                btreemap! { "hostname".into() => PropertyValue::String("t1".into()) },
                BTreeMap::new(),
                2,
            ),
        );
        m.services.insert(
            "db".into(),
            ManifestService {
                name: "db".into(),
                pkg: "/nix/store/xxx-db".into(),
                service_type: "process".into(),
                depends_on: vec![],
                connects_to: vec![],
                provides_containers: BTreeMap::new(),
            },
        );
        m.services.insert(
            "api".into(),
            ManifestService {
                name: "api".into(),
                pkg: "/nix/store/xxx-api".into(),
                service_type: "process".into(),
                depends_on: vec![InterDependencyMapping::new("db", "main", "T1")],
                connects_to: vec![],
                provides_containers: BTreeMap::new(),
            },
        );
        m.service_mapping_array = vec![
            ServiceMapping::new("db", "main", "T1"),
            ServiceMapping::new("api", "main", "T1"),
        ];
        m.service_mapping_array.sort();
        m.profile_mapping_table.insert("T1".into(), "/nix/var/nix/profiles/disnix".into());
        m
    }

    #[test]
    fn xml_round_trip_preserves_manifest() {
        let m = sample_manifest();
        let mut buf = Vec::new();
        m.print_xml(&mut buf).unwrap();
        let xml = String::from_utf8(buf).unwrap();
        let parsed = Manifest::parse_xml_str(&xml, LoadFlags::ALL, None, None).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn nix_round_trip_preserves_manifest() {
        let m = sample_manifest();
        let mut buf = Vec::new();
        m.print_nix(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let parsed = Manifest::parse_nix_str(&text).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn validate_rejects_dangling_service_reference() {
        let mut m = sample_manifest();
        m.service_mapping_array.push(ServiceMapping::new("ghost", "main", "T1"));
        assert!(m.validate().is_err());
    }

    #[test]
    fn validate_accepts_sample_manifest() {
        let m = sample_manifest();
        assert!(m.validate().is_ok());
    }

    #[test]
    fn snapshot_mapping_filter_restricts_to_container_and_component() {
        let xml = r#"<manifest>
<snapshotMappings>
<mapping><component>state</component><container>main</container><target>T1</target><service>db</service></mapping>
<mapping><component>other</component><container>aux</container><target>T1</target><service>db</service></mapping>
</snapshotMappings>
</manifest>"#;
        let m = Manifest::parse_xml_str(xml, LoadFlags::SNAPSHOT_MAPPINGS, Some("main"), Some("state")).unwrap();
        assert_eq!(m.snapshot_mapping_array.len(), 1);
        assert_eq!(m.snapshot_mapping_array[0].container, "main");
        assert_eq!(m.snapshot_mapping_array[0].component, "state");
    }
}
