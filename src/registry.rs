use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use http_types::Method;

use crate::acl::{Acl, AclEntry};
use crate::error::{BackendError, LoadError};
use crate::expr::{self, DirectorType, Probe, Scheme};
use crate::value::{parse_duration, Value, VclString};

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    pub request: Probe,
    pub expected_response: u16,
    pub interval: Duration,
    pub timeout: Duration,
    pub window: u32,
    pub threshold: u32,
    pub initial: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            request: Probe {
                method: Method::Head,
                scheme: Scheme::Http11,
                path: "/".to_string(),
                headers: Vec::new(),
            },
            expected_response: 200,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            window: 5,
            threshold: 3,
            initial: 3,
        }
    }
}

#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub host_header: Option<String>,
    pub always_use_host_header: bool,
    pub connect_timeout: Duration,
    pub first_byte_timeout: Duration,
    pub between_bytes_timeout: Duration,
    pub max_connections: u32,
    pub probe: Option<ProbeConfig>,
    healthy: AtomicBool,
}

impl Clone for Backend {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            ssl: self.ssl,
            host_header: self.host_header.clone(),
            always_use_host_header: self.always_use_host_header,
            connect_timeout: self.connect_timeout,
            first_byte_timeout: self.first_byte_timeout,
            between_bytes_timeout: self.between_bytes_timeout,
            max_connections: self.max_connections,
            probe: self.probe.clone(),
            healthy: AtomicBool::new(self.is_healthy()),
        }
    }
}

impl Backend {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            ssl: false,
            host_header: None,
            always_use_host_header: false,
            connect_timeout: Duration::from_secs(1),
            first_byte_timeout: Duration::from_secs(15),
            between_bytes_timeout: Duration::from_secs(10),
            max_connections: 200,
            probe: None,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release)
    }

    pub fn scheme(&self) -> &'static str {
        if self.ssl {
            "https"
        } else {
            "http"
        }
    }

    /// The `Host` header sent to this backend.
    pub fn authority(&self) -> String {
        match &self.host_header {
            Some(host) => host.clone(),
            None => self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectorMember {
    pub backend: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Director {
    pub name: String,
    pub kind: DirectorType,
    pub members: Vec<DirectorMember>,
    /// percentage of members that must be healthy
    pub quorum: u32,
    pub retries: u32,
}

impl Director {
    pub fn new(name: impl Into<String>, kind: DirectorType) -> Self {
        Self {
            name: name.into(),
            kind,
            members: Vec::new(),
            quorum: 0,
            retries: 5,
        }
    }
}

pub fn director_kind(name: &str) -> Option<DirectorType> {
    Some(match name {
        "random" => DirectorType::Random,
        "fallback" => DirectorType::Fallback,
        "hash" => DirectorType::Hash,
        "client" => DirectorType::Client,
        "chash" => DirectorType::ConsistentHash,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Regex(String),
    Backend(String),
}

impl TableValue {
    pub fn to_value(&self) -> Value {
        match self {
            TableValue::String(s) | TableValue::Regex(s) | TableValue::Backend(s) => {
                Value::str(s.clone())
            }
            TableValue::Integer(n) => Value::Integer(*n),
            TableValue::Float(n) => Value::Float(*n),
            TableValue::Bool(b) => Value::Bool(*b),
        }
    }

    pub fn from_value(value: &Value, ty: Option<expr::Type>) -> Option<TableValue> {
        Some(match ty {
            Some(expr::Type::Integer) => TableValue::Integer(value.to_i64()?),
            Some(expr::Type::Float) | Some(expr::Type::Rtime) => TableValue::Float(value.to_f64()?),
            Some(expr::Type::Bool) => TableValue::Bool(value.is_truthy()),
            Some(expr::Type::Regex) => TableValue::Regex(value.to_plain_string()),
            Some(expr::Type::Backend) => TableValue::Backend(value.to_plain_string()),
            _ => match value {
                Value::Integer(n) => TableValue::Integer(*n),
                Value::Float(n) => TableValue::Float(*n),
                Value::Bool(b) => TableValue::Bool(*b),
                other => TableValue::String(other.to_plain_string()),
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub name: String,
    pub value_type: Option<expr::Type>,
    pub entries: HashMap<String, TableValue>,
}

/// FNV-1a, used for the deterministic director kinds.
pub fn fnv1a(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Long-lived backends, directors, ACLs and tables shared by every request.
#[derive(Debug, Default)]
pub struct Registry {
    backends: RwLock<HashMap<String, Arc<Backend>>>,
    backend_order: RwLock<Vec<String>>,
    directors: RwLock<HashMap<String, Director>>,
    acls: RwLock<HashMap<String, Acl>>,
    tables: RwLock<HashMap<String, Table>>,
    probe_added: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_backend(&self, backend: Backend) {
        let name = backend.name.clone();
        let previous = self.backends.write().insert(name.clone(), Arc::new(backend));
        if previous.is_none() {
            self.backend_order.write().push(name);
        }
    }

    pub fn remove_backend(&self, name: &str) -> bool {
        let removed = self.backends.write().remove(name).is_some();
        if removed {
            self.backend_order.write().retain(|n| n != name);
        }
        removed
    }

    pub fn get_backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.read().get(name).cloned()
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.backends.read().contains_key(name)
    }

    /// Backends in declaration order.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        let backends = self.backends.read();
        self.backend_order
            .read()
            .iter()
            .filter_map(|name| backends.get(name).cloned())
            .collect()
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.get_backend(name)
            .map(|backend| backend.is_healthy())
            .unwrap_or(false)
    }

    pub fn set_healthy(&self, name: &str, healthy: bool) -> bool {
        match self.get_backend(name) {
            Some(backend) => {
                backend.set_healthy(healthy);
                true
            }
            None => false,
        }
    }

    /// Attaches probe parameters. The backend's health follows the probe's
    /// `initial` count until the checker reports.
    pub fn add_probe(&self, name: &str, probe: ProbeConfig) -> bool {
        {
            let mut backends = self.backends.write();
            let existing = match backends.get(name) {
                Some(existing) => existing,
                None => return false,
            };
            let mut updated = Backend::clone(existing);
            updated.set_healthy(probe.initial >= probe.threshold);
            updated.probe = Some(probe);
            backends.insert(name.to_string(), Arc::new(updated));
        }
        if let Some(sender) = self.probe_added.lock().as_ref() {
            let _ = sender.send(name.to_string());
        }
        true
    }

    /// Names of backends whose probe is attached from now on. Only the most
    /// recent receiver is notified.
    pub fn watch_probes(&self) -> mpsc::UnboundedReceiver<String> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.probe_added.lock() = Some(sender);
        receiver
    }

    pub fn add_director(&self, director: Director) {
        self.directors.write().insert(director.name.clone(), director);
    }

    pub fn remove_director(&self, name: &str) -> bool {
        self.directors.write().remove(name).is_some()
    }

    pub fn get_director(&self, name: &str) -> Option<Director> {
        self.directors.read().get(name).cloned()
    }

    pub fn has_director(&self, name: &str) -> bool {
        self.directors.read().contains_key(name)
    }

    pub fn add_director_member(&self, director: &str, backend: &str, weight: u32) -> bool {
        match self.directors.write().get_mut(director) {
            Some(director) => {
                director.members.retain(|m| m.backend != backend);
                director.members.push(DirectorMember {
                    backend: backend.to_string(),
                    weight,
                });
                true
            }
            None => false,
        }
    }

    pub fn remove_director_member(&self, director: &str, backend: &str) -> bool {
        match self.directors.write().get_mut(director) {
            Some(director) => {
                let before = director.members.len();
                director.members.retain(|m| m.backend != backend);
                director.members.len() != before
            }
            None => false,
        }
    }

    /// Picks a healthy member of `name`, or `None` when the director is
    /// unknown, has no healthy members, or misses its quorum.
    pub fn select_backend(&self, name: &str, hash_data: &[String], identity: &str) -> Option<String> {
        let director = self.get_director(name)?;
        let healthy: Vec<&DirectorMember> = director
            .members
            .iter()
            .filter(|member| self.is_healthy(&member.backend))
            .collect();

        let total = director.members.len() as u64;
        let required = (total * u64::from(director.quorum) + 99) / 100;
        if healthy.is_empty() || (healthy.len() as u64) < required {
            return None;
        }

        let chosen = match director.kind {
            DirectorType::Random => {
                let total_weight: u64 = healthy.iter().map(|m| u64::from(m.weight)).sum();
                if total_weight == 0 {
                    healthy[fastrand::usize(..healthy.len())]
                } else {
                    let mut pick = fastrand::u64(..total_weight);
                    let mut chosen = healthy[healthy.len() - 1];
                    for member in &healthy {
                        let weight = u64::from(member.weight);
                        if pick < weight {
                            chosen = member;
                            break;
                        }
                        pick -= weight;
                    }
                    chosen
                }
            }
            DirectorType::Hash | DirectorType::ConsistentHash => {
                let index = fnv1a(&hash_data.join(":")) % healthy.len() as u64;
                healthy[index as usize]
            }
            DirectorType::Client => {
                let index = fnv1a(identity) % healthy.len() as u64;
                healthy[index as usize]
            }
            DirectorType::Fallback => healthy[0],
        };
        Some(chosen.backend.clone())
    }

    /// Resolves a director or backend name to a healthy backend.
    pub fn resolve(
        &self,
        name: &str,
        hash_data: &[String],
        identity: &str,
    ) -> Result<Arc<Backend>, BackendError> {
        if self.has_director(name) {
            let selected = self
                .select_backend(name, hash_data, identity)
                .ok_or(BackendError::NoBackend)?;
            return self.get_backend(&selected).ok_or(BackendError::NoBackend);
        }
        match self.get_backend(name) {
            Some(backend) if backend.is_healthy() => Ok(backend),
            Some(backend) => Err(BackendError::Unhealthy(backend.name.clone())),
            None => Err(BackendError::NoBackend),
        }
    }

    pub fn add_acl(&self, acl: Acl) {
        self.acls.write().insert(acl.name.clone(), acl);
    }

    pub fn remove_acl(&self, name: &str) -> bool {
        self.acls.write().remove(name).is_some()
    }

    pub fn has_acl(&self, name: &str) -> bool {
        self.acls.read().contains_key(name)
    }

    /// `None` when `name` is not an ACL.
    pub fn acl_contains(&self, name: &str, ip: &str) -> Option<bool> {
        self.acls.read().get(name).map(|acl| acl.contains(ip))
    }

    pub fn add_acl_entry(&self, name: &str, entry: AclEntry) -> bool {
        match self.acls.write().get_mut(name) {
            Some(acl) => {
                acl.add(entry);
                true
            }
            None => false,
        }
    }

    pub fn remove_acl_entry(&self, name: &str, entry: &AclEntry) -> bool {
        match self.acls.write().get_mut(name) {
            Some(acl) => acl.remove(entry),
            None => false,
        }
    }

    pub fn add_table(&self, table: Table) {
        self.tables.write().insert(table.name.clone(), table);
    }

    pub fn remove_table(&self, name: &str) -> bool {
        self.tables.write().remove(name).is_some()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    pub fn table_get(&self, name: &str, key: &str) -> Option<TableValue> {
        self.tables
            .read()
            .get(name)
            .and_then(|table| table.entries.get(key).cloned())
    }

    pub fn table_contains(&self, name: &str, key: &str) -> bool {
        self.table_get(name, key).is_some()
    }

    pub fn table_set(&self, name: &str, key: &str, value: TableValue) -> bool {
        match self.tables.write().get_mut(name) {
            Some(table) => {
                table.entries.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub fn table_value_type(&self, name: &str) -> Option<expr::Type> {
        self.tables.read().get(name).and_then(|t| t.value_type)
    }

    pub fn table_remove_key(&self, name: &str, key: &str) -> bool {
        match self.tables.write().get_mut(name) {
            Some(table) => table.entries.remove(key).is_some(),
            None => false,
        }
    }

    pub fn lookup_string(&self, name: &str, key: &str, default: VclString) -> VclString {
        match self.table_get(name, key) {
            Some(TableValue::Integer(n)) => VclString::from(n.to_string()),
            Some(TableValue::Float(n)) => VclString::from(Value::Float(n).to_string()),
            Some(TableValue::Bool(_)) | None => default,
            Some(TableValue::String(s)) | Some(TableValue::Regex(s)) | Some(TableValue::Backend(s)) => {
                VclString::from(s)
            }
        }
    }

    pub fn lookup_integer(&self, name: &str, key: &str, default: i64) -> i64 {
        match self.table_get(name, key) {
            Some(TableValue::Integer(n)) => n,
            Some(TableValue::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn lookup_float(&self, name: &str, key: &str, default: f64) -> f64 {
        match self.table_get(name, key) {
            Some(TableValue::Float(n)) => n,
            Some(TableValue::Integer(n)) => n as f64,
            Some(TableValue::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn lookup_bool(&self, name: &str, key: &str, default: bool) -> bool {
        match self.table_get(name, key) {
            Some(TableValue::Bool(b)) => b,
            Some(TableValue::String(s)) => match s.as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => default,
            },
            _ => default,
        }
    }

    pub fn lookup_regex(&self, name: &str, key: &str, default: &str) -> String {
        match self.table_get(name, key) {
            Some(TableValue::Regex(s)) | Some(TableValue::String(s)) => s,
            _ => default.to_string(),
        }
    }

    /// Builds the registry from a program's backend, director, acl and table
    /// declarations. Property values must be constants.
    pub fn from_program(program: &expr::Program) -> Result<Registry, LoadError> {
        let registry = Registry::new();

        for decl in &program.body {
            match decl {
                expr::Declaration::Backend(backend) => {
                    registry.add_backend(backend_from_decl(backend)?);
                    if let Some(probe) = &backend.body.probe {
                        registry.add_probe(&backend.name.name, probe_from_decl(&backend.name.name, probe)?);
                    }
                }
                expr::Declaration::Director(director) => {
                    registry.add_director(director_from_decl(director)?)
                }
                expr::Declaration::Acl(acl) => registry.add_acl(acl_from_decl(acl)?),
                expr::Declaration::Table(table) => registry.add_table(table_from_decl(table)?),
                _ => {}
            }
        }

        Ok(registry)
    }
}

/// Evaluates a declaration property. Bare identifiers name other objects.
pub fn constant(expr: &expr::Expr) -> Option<Value> {
    match expr {
        expr::Expr::Literal(lit, _) => Some(match lit {
            expr::Literal::String(s) => Value::str(s.clone()),
            expr::Literal::Integer(n) | expr::Literal::Percent(n) => Value::Integer(*n),
            expr::Literal::Float(n) => Value::Float(*n),
            expr::Literal::True => Value::Bool(true),
            expr::Literal::False => Value::Bool(false),
        }),
        expr::Expr::Variable(sym) => Some(Value::str(sym.name.clone())),
        expr::Expr::Grouping(inner) => constant(inner),
        expr::Expr::Unary(op, inner) if op.ty == expr::UnaryOpTy::Minus => match constant(inner)? {
            Value::Integer(n) => Some(Value::Integer(-n)),
            Value::Float(n) => Some(Value::Float(-n)),
            _ => None,
        },
        expr::Expr::Binary(lhs, op, rhs)
            if matches!(op.ty, expr::BinaryOpTy::Concat | expr::BinaryOpTy::Plus) =>
        {
            let lhs = constant(lhs)?;
            let rhs = constant(rhs)?;
            Some(Value::str(format!(
                "{}{}",
                lhs.to_plain_string(),
                rhs.to_plain_string()
            )))
        }
        _ => None,
    }
}

fn declaration_error(kind: &'static str, name: &str, message: impl Into<String>) -> LoadError {
    LoadError::Declaration {
        kind,
        name: name.to_string(),
        message: message.into(),
    }
}

fn constant_of(
    kind: &'static str,
    name: &str,
    field: &str,
    expr: &Option<expr::Expr>,
) -> Result<Option<Value>, LoadError> {
    match expr {
        Some(expr) => constant(expr)
            .map(Some)
            .ok_or_else(|| declaration_error(kind, name, format!(".{} must be a constant", field))),
        None => Ok(None),
    }
}

fn duration_of(value: Option<Value>, default: Duration) -> Duration {
    match value {
        Some(Value::String(s)) => parse_duration(s.as_str())
            .filter(|secs| *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(default),
        Some(other) => other
            .to_f64()
            .filter(|secs| *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(default),
        None => default,
    }
}

fn backend_from_decl(decl: &expr::Backend) -> Result<Backend, LoadError> {
    let name = decl.name.name.as_str();
    let body = &decl.body;
    let field = |field: &str, expr: &Option<expr::Expr>| constant_of("backend", name, field, expr);

    let host = match field("host", &body.host)? {
        Some(host) => host.to_plain_string(),
        None => return Err(declaration_error("backend", name, ".host is required")),
    };
    let ssl = field("ssl", &body.ssl)?.map(|v| v.is_truthy()).unwrap_or(false);
    let port = match field("port", &body.port)? {
        Some(port) => match port.to_i64() {
            Some(port) if (1..=65535).contains(&port) => port as u16,
            _ => return Err(declaration_error("backend", name, format!("invalid .port {}", port))),
        },
        None if ssl => 443,
        None => 80,
    };

    let mut backend = Backend::new(name, host, port);
    backend.ssl = ssl;
    backend.host_header = field("host_header", &body.host_header)?.map(|v| v.to_plain_string());
    backend.always_use_host_header = field("always_use_host_header", &body.always_use_host_header)?
        .map(|v| v.is_truthy())
        .unwrap_or(false);
    backend.connect_timeout = duration_of(
        field("connect_timeout", &body.connect_timeout)?,
        backend.connect_timeout,
    );
    backend.first_byte_timeout = duration_of(
        field("first_byte_timeout", &body.first_byte_timeout)?,
        backend.first_byte_timeout,
    );
    backend.between_bytes_timeout = duration_of(
        field("between_bytes_timeout", &body.between_bytes_timeout)?,
        backend.between_bytes_timeout,
    );
    if let Some(max) = field("max_connections", &body.max_connections)?.and_then(|v| v.to_i64()) {
        backend.max_connections = max.max(0) as u32;
    }
    Ok(backend)
}

fn probe_from_decl(backend: &str, decl: &expr::Healthcheck) -> Result<ProbeConfig, LoadError> {
    let field = |field: &str, expr: &Option<expr::Expr>| constant_of("probe", backend, field, expr);
    let count = |value: Option<Value>, default: u32| {
        value
            .and_then(|v| v.to_i64())
            .map(|n| n.max(0) as u32)
            .unwrap_or(default)
    };

    let mut probe = ProbeConfig::default();
    if let Some(request) = &decl.request {
        probe.request = request.clone();
    }
    probe.expected_response = count(field("expected_response", &decl.expected_response)?, 200) as u16;
    probe.interval = duration_of(field("interval", &decl.interval)?, probe.interval);
    probe.timeout = duration_of(field("timeout", &decl.timeout)?, probe.timeout);
    probe.window = count(field("window", &decl.window)?, probe.window).max(1);
    probe.threshold = count(field("threshold", &decl.threshold)?, probe.threshold).min(probe.window);
    probe.initial = count(field("initial", &decl.initial)?, probe.threshold);
    Ok(probe)
}

fn director_from_decl(decl: &expr::Director) -> Result<Director, LoadError> {
    let name = decl.name.name.as_str();
    let field = |field: &str, expr: &Option<expr::Expr>| constant_of("director", name, field, expr);

    let mut director = Director::new(name, decl.director_type);
    if let Some(quorum) = field("quorum", &decl.body.quorum)?.and_then(|v| v.to_i64()) {
        director.quorum = quorum.clamp(0, 100) as u32;
    }
    if let Some(retries) = field("retries", &decl.body.retries)?.and_then(|v| v.to_i64()) {
        director.retries = retries.max(0) as u32;
    }
    for member in &decl.body.backends {
        let backend = match field("backend", &member.backend)? {
            Some(backend) => backend.to_plain_string(),
            None => {
                return Err(declaration_error(
                    "director",
                    name,
                    "every member needs a .backend",
                ))
            }
        };
        let weight = field("weight", &member.weight)?
            .and_then(|v| v.to_i64())
            .map(|n| n.max(0) as u32)
            .unwrap_or(1);
        director.members.push(DirectorMember { backend, weight });
    }
    Ok(director)
}

fn acl_from_decl(decl: &expr::Acl) -> Result<Acl, LoadError> {
    let mut acl = Acl::new(decl.name.name.clone());
    for entry in &decl.body {
        match AclEntry::parse(&entry.address, entry.prefix, entry.negated) {
            Some(parsed) => acl.add(parsed),
            None => {
                return Err(declaration_error(
                    "acl",
                    &decl.name.name,
                    format!(
                        "invalid entry {:?} at line={},col={}",
                        entry.address, entry.location.line, entry.location.col
                    ),
                ))
            }
        }
    }
    Ok(acl)
}

fn table_from_decl(decl: &expr::Table) -> Result<Table, LoadError> {
    let name = decl.name.name.as_str();
    let mut entries = HashMap::new();
    for entry in &decl.body {
        let value = constant(&entry.value)
            .and_then(|v| TableValue::from_value(&v, decl.value_type))
            .ok_or_else(|| {
                declaration_error("table", name, format!("invalid value for key {:?}", entry.key))
            })?;
        entries.insert(entry.key.clone(), value);
    }
    Ok(Table {
        name: name.to_string(),
        value_type: decl.value_type,
        entries,
    })
}
