use crate::SkeinResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use url::Url;

/// Resource request per container.
/// Memory is in MiB, vcores map to physical cores per cluster configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub memory: u64,
    pub vcores: u32,
}

impl Resources {
    pub fn new(memory: u64, vcores: u32) -> Self {
        Self { memory, vcores }
    }

    pub fn fits_within(&self, max: &Resources) -> bool {
        self.memory <= max.memory && self.vcores <= max.vcores
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    #[serde(rename = "FILE", alias = "file")]
    File,
    #[serde(rename = "ARCHIVE", alias = "archive")]
    Archive,
}

impl FileKind {
    /// Archives are inferred from the usual suffixes, everything else is a plain file.
    fn infer(source: &str) -> FileKind {
        if [".zip", ".tar.gz", ".tgz"].iter().any(|ext| source.ends_with(ext)) {
            FileKind::Archive
        } else {
            FileKind::File
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileVisibility {
    #[default]
    #[serde(rename = "APPLICATION", alias = "application")]
    Application,
    #[serde(rename = "PUBLIC", alias = "public")]
    Public,
    #[serde(rename = "PRIVATE", alias = "private")]
    Private,
}

/// A file or archive localized into a container's working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub source: String,
    #[serde(default, rename = "type")]
    pub kind: Option<FileKind>,
    #[serde(default)]
    pub visibility: FileVisibility,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub timestamp: u64,
}

impl File {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), kind: None, visibility: FileVisibility::default(), size: 0, timestamp: 0 }
    }

    /// The kind of this file, inferred from the source suffix when not set explicitly.
    pub fn kind(&self) -> FileKind {
        self.kind.unwrap_or_else(|| FileKind::infer(&self.source))
    }

    /// Rewrite a schemeless source as a `file://` url, resolving relative paths
    /// against `origin` (the directory of the spec file it came from).
    fn normalize(&mut self, origin: Option<&Path>) -> SkeinResult<()> {
        match Url::parse(&self.source) {
            Ok(_) => Ok(()),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let path = Path::new(&self.source);
                let abs = if path.is_absolute() {
                    path.to_path_buf()
                } else if let Some(origin) = origin {
                    origin.join(path)
                } else {
                    bail!("file source `{}` is relative but has no origin to resolve against", self.source)
                };
                let url = Url::from_file_path(&abs)
                    .map_err(|()| eyre!("file source `{}` is not a valid path", abs.display()))?;
                self.source = url.into();
                Ok(())
            }
            Err(err) => bail!("invalid file source `{}`: {}", self.source, err),
        }
    }
}

fn default_instances() -> u32 {
    1
}

/// Description of a single service: what to run, with what resources,
/// and which services must be ready first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Maximum restarts across all containers of the service, `-1` for unlimited.
    #[serde(default)]
    pub max_restarts: i64,
    pub resources: Resources,
    #[serde(default)]
    pub files: BTreeMap<String, File>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub commands: Vec<String>,
    #[serde(default)]
    pub depends: BTreeSet<String>,
}

impl ServiceSpec {
    fn validate(&self, name: &str) -> SkeinResult<()> {
        if self.max_restarts < -1 {
            bail!("service `{}`: max_restarts must be >= -1", name);
        }
        if self.resources.memory == 0 {
            bail!("service `{}`: memory must be positive", name);
        }
        if self.resources.vcores == 0 {
            bail!("service `{}`: vcores must be positive", name);
        }
        if self.commands.is_empty() {
            bail!("service `{}`: there must be at least one command", name);
        }
        for (dest, _) in &self.files {
            if dest.is_empty() {
                bail!("service `{}`: file destinations must be non-empty", name);
            }
        }
        Ok(())
    }
}

fn default_name() -> String {
    "skein".into()
}

fn default_queue() -> String {
    "default".into()
}

fn default_max_attempts() -> u32 {
    1
}

/// A complete description of an application, immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub services: BTreeMap<String, ServiceSpec>,
}

impl ApplicationSpec {
    /// Load a spec from a yaml or json file, inferring the format from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> SkeinResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|err| eyre!("failed to read spec file `{}`: {}", path.display(), err))?;
        let mut spec: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&data)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&data)?,
            _ => bail!("unsupported spec file type `{}`", path.display()),
        };
        let origin = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let origin = std::fs::canonicalize(&origin)
            .map_err(|err| eyre!("failed to resolve spec directory `{}`: {}", origin.display(), err))?;
        spec.normalize(Some(&origin))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_yaml(data: &str) -> SkeinResult<Self> {
        let mut spec: Self = serde_yaml::from_str(data)?;
        spec.normalize(None)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_json(data: &str) -> SkeinResult<Self> {
        let mut spec: Self = serde_json::from_str(data)?;
        spec.normalize(None)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    fn normalize(&mut self, origin: Option<&Path>) -> SkeinResult<()> {
        for service in self.services.values_mut() {
            for file in service.files.values_mut() {
                file.normalize(origin)?;
            }
        }
        Ok(())
    }

    /// Validation is total: either the entire spec is accepted, or it is
    /// rejected before any container is requested.
    pub fn validate(&self) -> SkeinResult<()> {
        if self.name.is_empty() {
            bail!("application name must be non-empty");
        }
        if self.max_attempts < 1 {
            bail!("max_attempts must be >= 1");
        }
        if self.services.is_empty() {
            bail!("there must be at least one service");
        }
        for (name, service) in &self.services {
            if name.is_empty() {
                bail!("service names must be non-empty");
            }
            service.validate(name)?;
            for dep in &service.depends {
                if !self.services.contains_key(dep) {
                    bail!("unknown dependency `{}` for service `{}`", dep, name);
                }
            }
        }
        check_no_cycles(&self.services)
    }

    /// Check every service's request against the cluster-reported maximum allocation.
    pub fn validate_resources(&self, max: &Resources) -> SkeinResult<()> {
        for (name, service) in &self.services {
            if !service.resources.fits_within(max) {
                bail!(
                    "service `{}` requests {}MiB/{} vcores, exceeding the cluster maximum of {}MiB/{} vcores",
                    name,
                    service.resources.memory,
                    service.resources.vcores,
                    max.memory,
                    max.vcores
                );
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Active,
    Done,
}

fn check_no_cycles(services: &BTreeMap<String, ServiceSpec>) -> SkeinResult<()> {
    fn visit<'a>(
        name: &'a str,
        services: &'a BTreeMap<String, ServiceSpec>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> SkeinResult<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Active) => {
                let start = path.iter().position(|&n| n == name).unwrap_or(0);
                bail!(
                    "dependency cycle detected between services: {}->{}",
                    path[start..].join("->"),
                    name
                );
            }
            None => {}
        }
        marks.insert(name, Mark::Active);
        path.push(name);
        for dep in &services[name].depends {
            visit(dep, services, marks, path)?;
        }
        path.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut path = Vec::new();
    for name in services.keys() {
        visit(name, services, &mut marks, &mut path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(commands: &[&str], depends: &[&str]) -> ServiceSpec {
        ServiceSpec {
            instances: 1,
            max_restarts: 0,
            resources: Resources::new(128, 1),
            files: Default::default(),
            env: Default::default(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            depends: depends.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn spec(services: &[(&str, ServiceSpec)]) -> ApplicationSpec {
        ApplicationSpec {
            name: "test".into(),
            queue: "default".into(),
            tags: Default::default(),
            max_attempts: 1,
            services: services.iter().map(|(n, s)| (n.to_string(), s.clone())).collect(),
        }
    }

    #[test]
    fn yaml_defaults() {
        let spec = ApplicationSpec::from_yaml(
            r#"
services:
  sleeper:
    resources:
      memory: 128
      vcores: 1
    commands:
      - sleep infinity
"#,
        )
        .unwrap();
        assert_eq!(spec.name, "skein");
        assert_eq!(spec.queue, "default");
        assert_eq!(spec.max_attempts, 1);
        let svc = &spec.services["sleeper"];
        assert_eq!(svc.instances, 1);
        assert_eq!(svc.max_restarts, 0);
        assert!(svc.depends.is_empty());
    }

    #[test]
    fn file_kind_inference() {
        assert_eq!(File::new("hdfs:///data/env.tar.gz").kind(), FileKind::Archive);
        assert_eq!(File::new("file:///opt/app.zip").kind(), FileKind::Archive);
        assert_eq!(File::new("file:///opt/run.sh").kind(), FileKind::File);
        let mut explicit = File::new("file:///opt/weird.tgz.bak");
        explicit.kind = Some(FileKind::Archive);
        assert_eq!(explicit.kind(), FileKind::Archive);
    }

    #[test]
    fn file_normalization() {
        let mut file = File::new("/opt/app/run.sh");
        file.normalize(None).unwrap();
        assert_eq!(file.source, "file:///opt/app/run.sh");

        let mut file = File::new("scripts/run.sh");
        file.normalize(Some(Path::new("/srv/specs"))).unwrap();
        assert_eq!(file.source, "file:///srv/specs/scripts/run.sh");

        let mut file = File::new("scripts/run.sh");
        assert!(file.normalize(None).is_err());

        let mut file = File::new("hdfs://namenode:9000/x");
        file.normalize(None).unwrap();
        assert_eq!(file.source, "hdfs://namenode:9000/x");
    }

    #[test]
    fn rejects_empty_services() {
        let err = spec(&[]).validate().unwrap_err();
        assert!(err.to_string().contains("at least one service"));
    }

    #[test]
    fn rejects_empty_commands() {
        let err = spec(&[("a", service(&[], &[]))]).validate().unwrap_err();
        assert!(err.to_string().contains("at least one command"));
    }

    #[test]
    fn rejects_zero_resources() {
        let mut svc = service(&["true"], &[]);
        svc.resources.memory = 0;
        assert!(spec(&[("a", svc)]).validate().is_err());

        let mut svc = service(&["true"], &[]);
        svc.resources.vcores = 0;
        assert!(spec(&[("a", svc)]).validate().is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = spec(&[("a", service(&["true"], &["ghost"]))]).validate().unwrap_err();
        assert!(err.to_string().contains("unknown dependency `ghost`"));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let err = spec(&[
            ("a", service(&["true"], &["b"])),
            ("b", service(&["true"], &["c"])),
            ("c", service(&["true"], &["a"])),
        ])
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn accepts_diamond_dependencies() {
        spec(&[
            ("a", service(&["true"], &[])),
            ("b", service(&["true"], &["a"])),
            ("c", service(&["true"], &["a"])),
            ("d", service(&["true"], &["b", "c"])),
        ])
        .validate()
        .unwrap();
    }

    #[test]
    fn resource_maximum() {
        let app = spec(&[("a", service(&["true"], &[]))]);
        app.validate_resources(&Resources::new(1024, 4)).unwrap();
        assert!(app.validate_resources(&Resources::new(64, 4)).is_err());
    }
}
