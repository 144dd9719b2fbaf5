use http_types::Method;

use derive_builder::Builder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Assign,
    Addition,
    Subtraction,
    Multiplication,
    Division,
    Modulus,
    BitwiseOr,
    BitwiseAnd,
    BitwiseXor,
    LeftShift,
    RightShift,
    LeftRotate,
    RightRotate,
    LogicalAnd,
    LogicalOr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal, SourceLocation),
    /// A string literal in the pattern position of `~`/`!~`.
    Regex(String, SourceLocation),
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Logical(Box<Expr>, LogicalOp, Box<Expr>),
    /// `cond ? a : b` and `if(cond, a, b)`
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>, SourceLocation),
    Call(Symbol, Vec<Expr>),
    Variable(Symbol),
    Get(Box<Expr>, Symbol),
    Grouping(Box<Expr>),
}

impl Expr {
    pub fn location(&self) -> SourceLocation {
        match self {
            Expr::Literal(_, loc) | Expr::Regex(_, loc) | Expr::Ternary(_, _, _, loc) => *loc,
            Expr::Unary(op, _) => SourceLocation {
                line: op.line,
                col: op.col,
            },
            Expr::Binary(_, op, _) => SourceLocation {
                line: op.line,
                col: op.col,
            },
            Expr::Logical(lhs, _, _) | Expr::Grouping(lhs) => lhs.location(),
            Expr::Call(sym, _) | Expr::Variable(sym) | Expr::Get(_, sym) => SourceLocation {
                line: sym.line,
                col: sym.col,
            },
        }
    }

    /// The dotted path named by a variable or member-access chain, if any.
    pub fn path(&self) -> Option<String> {
        match self {
            Expr::Variable(sym) => Some(sym.name.clone()),
            Expr::Get(object, sym) => object.path().map(|base| format!("{}.{}", base, sym.name)),
            Expr::Grouping(inner) => inner.path(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    Or,
    And,
}

#[derive(Debug, Eq, PartialEq, Hash, Clone)]
pub struct Symbol {
    pub name: String,
    pub line: usize,
    pub col: usize,
    pub var_type: Option<Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubDecl {
    pub name: Symbol,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub name: Symbol,
    pub body: BackendBody,
}

#[derive(Default, Debug, Clone, PartialEq, Builder)]
pub struct BackendBody {
    #[builder(setter(strip_option), default)]
    pub dynamic: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub share_key: Option<Expr>,

    // server location
    #[builder(setter(strip_option), default)]
    pub host: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub port: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub ssl: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub ssl_cert_hostname: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub ssl_check_cert: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub ssl_sni_hostname: Option<Expr>,

    // timeouts and limits
    #[builder(setter(strip_option), default)]
    pub between_bytes_timeout: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub connect_timeout: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub first_byte_timeout: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub max_connections: Option<Expr>,

    // host header override
    #[builder(setter(strip_option), default)]
    pub host_header: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub always_use_host_header: Option<Expr>,

    // healthcheck
    #[builder(setter(strip_option), default)]
    pub probe: Option<Healthcheck>,
}

#[derive(Default, Debug, Clone, PartialEq, Builder)]
pub struct Healthcheck {
    #[builder(setter(strip_option), default)]
    pub dummy: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub request: Option<Probe>,
    #[builder(setter(strip_option), default)]
    pub expected_response: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub interval: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub timeout: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub window: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub initial: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub threshold: Option<Expr>,
}

/// The request line and headers a health probe sends.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct Probe {
    pub method: Method,
    pub scheme: Scheme,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Scheme {
    Http10,
    Http11,
}

impl From<&str> for Scheme {
    fn from(i: &str) -> Self {
        match i.to_lowercase().as_str() {
            "http/1.0" => Self::Http10,
            _ => Self::Http11,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Director {
    pub name: Symbol,
    pub body: DirectorBody,
    pub director_type: DirectorType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectorType {
    Random,
    Fallback,
    Hash,
    Client,
    ConsistentHash,
}

#[derive(Default, Debug, Clone, PartialEq, Builder)]
pub struct DirectorBody {
    #[builder(setter(strip_option), default)]
    pub retries: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub quorum: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub key: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub seed: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub vnodes_per_node: Option<Expr>,

    #[builder(default)]
    pub backends: Vec<DirectorBackend>,
}

#[derive(Default, Debug, Clone, PartialEq, Builder)]
pub struct DirectorBackend {
    #[builder(setter(strip_option), default)]
    pub id: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub backend: Option<Expr>,
    #[builder(setter(strip_option), default)]
    pub weight: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: Symbol,
    pub value_type: Option<Type>,
    pub body: Vec<TableEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    pub key: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acl {
    pub name: Symbol,
    pub body: Vec<AclEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AclEntry {
    pub address: String,
    pub prefix: Option<u8>,
    pub negated: bool,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub status: Option<Expr>,
    pub message: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Declaration>,
}

impl Program {
    pub fn subroutines(&self) -> impl Iterator<Item = &SubDecl> {
        self.body.iter().filter_map(|decl| match decl {
            Declaration::SubDecl(sub) => Some(sub),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Acl(Acl),
    Backend(Box<Backend>),
    Director(Box<Director>),
    SubDecl(SubDecl),
    Table(Table),
    Include(String, SourceLocation),
    Import(Symbol),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Esi(SourceLocation),
    Expr(Expr),
    If(Expr, Box<Stmt>, Option<Box<Stmt>>),
    VarDecl(Symbol),
    Block(Vec<Stmt>),
    Return(SourceLocation, Option<Symbol>),
    Call(Symbol),
    Goto(Symbol),
    Label(Symbol),

    Log(Expr),
    Restart(SourceLocation),
    Error(Error, SourceLocation),
    HashData(Expr),

    Add(Expr, Expr),
    Set(Expr, Assignment, Expr),
    Unset(Expr),
    Synthetic(Expr),
    SyntheticBase64(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOpTy {
    Bang,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnaryOp {
    pub ty: UnaryOpTy,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOpTy {
    EqualEqual,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Match,
    NotMatch,
    /// Implicit concatenation of adjacent operands.
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryOp {
    pub ty: BinaryOpTy,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Float(f64),
    Integer(i64),
    String(String),
    True,
    False,
    Percent(i64),
}

#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy)]
pub enum Type {
    Acl,
    Backend,
    Bool,
    Float,
    Id,
    Integer,
    Ip,
    Rtime,
    String,
    Time,
    Director,
    Regex,
}

impl Type {
    pub fn from_name(name: &str) -> Option<Type> {
        Some(match name {
            "ACL" => Type::Acl,
            "BACKEND" => Type::Backend,
            "BOOL" => Type::Bool,
            "FLOAT" => Type::Float,
            "ID" => Type::Id,
            "INTEGER" => Type::Integer,
            "IP" => Type::Ip,
            "RTIME" => Type::Rtime,
            "STRING" => Type::String,
            "TIME" => Type::Time,
            "REGEX" => Type::Regex,
            _ => return None,
        })
    }
}
