use crate::expr;
use crate::parse_probe;
use crate::scanner;

use thiserror::Error;

/// The first unrecoverable mismatch found while parsing. There is no error
/// recovery: parsing stops here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at line={line},col={column}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    fn at(token: &scanner::Token, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: token.line,
            column: token.col,
        }
    }
}

const RETURN_ACTIONS: &[&str] = &[
    "lookup",
    "pass",
    "error",
    "restart",
    "hash",
    "deliver",
    "fetch",
    "deliver_stale",
    "pipe",
];

#[derive(Default)]
struct Parser {
    tokens: Vec<scanner::Token>,
    current: usize,
}

pub fn parse(tokens: Vec<scanner::Token>) -> Result<expr::Program, ParseError> {
    let mut p = Parser {
        tokens,
        ..Parser::default()
    };
    if p.tokens.is_empty() {
        return Ok(expr::Program { body: Vec::new() });
    }
    p.parse()
}

impl Parser {
    fn parse(&mut self) -> Result<expr::Program, ParseError> {
        let mut body = Vec::new();

        while !self.is_at_end() {
            if let Some(decl) = self.declaration()? {
                body.push(decl);
            }
        }

        Ok(expr::Program { body })
    }

    fn declaration(&mut self) -> Result<Option<expr::Declaration>, ParseError> {
        if self.matches(scanner::TokenType::Sub) {
            return Ok(Some(expr::Declaration::SubDecl(self.sub_decl()?)));
        }

        if self.matches(scanner::TokenType::Acl) {
            return Ok(Some(expr::Declaration::Acl(self.acl_decl()?)));
        }

        if self.matches(scanner::TokenType::Backend) {
            return Ok(Some(expr::Declaration::Backend(Box::new(
                self.backend_decl()?,
            ))));
        }

        if self.matches(scanner::TokenType::Director) {
            return Ok(Some(expr::Declaration::Director(Box::new(
                self.director_decl()?,
            ))));
        }

        if self.matches(scanner::TokenType::Table) {
            return Ok(Some(expr::Declaration::Table(self.table_decl()?)));
        }

        if self.matches(scanner::TokenType::Include) {
            let token = self
                .consume(
                    scanner::TokenType::String,
                    "Expected string after include statement.",
                )?
                .clone();
            self.consume(
                scanner::TokenType::Semicolon,
                "Expected ; after include statement",
            )?;
            return Ok(Some(expr::Declaration::Include(
                Self::string_value(&token),
                Self::location(&token),
            )));
        }

        if self.matches(scanner::TokenType::Import) {
            let token = self
                .consume(
                    scanner::TokenType::Identifier,
                    "Expected module name after import.",
                )?
                .clone();
            self.consume(
                scanner::TokenType::Semicolon,
                "Expected ; after import statement",
            )?;
            return Ok(Some(expr::Declaration::Import(Self::symbol(&token, None))));
        }

        if self.matches(scanner::TokenType::Pragma) {
            while !self.check(scanner::TokenType::Semicolon) && !self.is_at_end() {
                self.advance();
            }
            self.consume(scanner::TokenType::Semicolon, "Expected ; after pragma")?;
            return Ok(None);
        }

        Err(ParseError::at(
            self.peek(),
            format!(
                "Expected a declaration (sub, acl, backend, director, table, include, import) but found {:?}",
                self.peek().ty
            ),
        ))
    }

    fn symbol(token: &scanner::Token, var_type: Option<expr::Type>) -> expr::Symbol {
        expr::Symbol {
            name: token.lexeme.clone(),
            line: token.line,
            col: token.col,
            var_type,
        }
    }

    fn location(token: &scanner::Token) -> expr::SourceLocation {
        expr::SourceLocation {
            line: token.line,
            col: token.col,
        }
    }

    fn string_value(token: &scanner::Token) -> String {
        match &token.literal {
            Some(scanner::Literal::Str(s)) => s.clone(),
            Some(scanner::Literal::AclEntry(s, _)) => s.clone(),
            _ => token.lexeme.clone(),
        }
    }

    fn acl_decl(&mut self) -> Result<expr::Acl, ParseError> {
        let name_tok = self
            .consume(scanner::TokenType::Identifier, "Expected acl name")?
            .clone();

        self.consume(scanner::TokenType::LeftBrace, "Expected { before acl body")?;

        let mut body = Vec::new();
        while !self.check(scanner::TokenType::RightBrace) && !self.is_at_end() {
            let negated = self.matches(scanner::TokenType::Bang);
            let token = self.peek().clone();
            let (address, prefix) = match &token.literal {
                Some(scanner::Literal::AclEntry(address, prefix)) => {
                    (address.clone(), Some(*prefix))
                }
                Some(scanner::Literal::Str(address)) => (address.clone(), None),
                _ => {
                    return Err(ParseError::at(
                        &token,
                        format!("Expected acl entry but found {:?}", token.ty),
                    ))
                }
            };
            self.advance();
            self.consume(scanner::TokenType::Semicolon, "Expected ; after acl entry")?;
            body.push(expr::AclEntry {
                address,
                prefix,
                negated,
                location: Self::location(&token),
            });
        }

        self.consume(scanner::TokenType::RightBrace, "Expected } after acl block.")?;

        Ok(expr::Acl {
            name: Self::symbol(&name_tok, Some(expr::Type::Acl)),
            body,
        })
    }

    fn property_name(&mut self, what: &str) -> Result<scanner::Token, ParseError> {
        self.consume(
            scanner::TokenType::Dot,
            &format!("Expected . before {} property", what),
        )?;
        let token = self
            .consume(
                scanner::TokenType::Identifier,
                &format!("Expected identifier for {} property name", what),
            )?
            .clone();
        self.consume(
            scanner::TokenType::Equal,
            &format!("Expected = after {} property name", what),
        )?;
        Ok(token)
    }

    fn check_duplicate(fields: &mut Vec<String>, token: &scanner::Token) -> Result<(), ParseError> {
        if fields.contains(&token.lexeme) {
            return Err(ParseError::at(
                token,
                format!("Duplicate property {:?}", token.lexeme),
            ));
        }
        fields.push(token.lexeme.clone());
        Ok(())
    }

    fn unknown_property(token: &scanner::Token) -> ParseError {
        ParseError::at(token, format!("Unknown property {:?}", token.lexeme))
    }

    fn director_decl(&mut self) -> Result<expr::Director, ParseError> {
        let name_tok = self
            .consume(scanner::TokenType::Identifier, "Expected director name")?
            .clone();

        let type_tok = self
            .consume(scanner::TokenType::Identifier, "Expected director type")?
            .clone();

        let director_type = match type_tok.lexeme.as_str() {
            "random" => expr::DirectorType::Random,
            "fallback" => expr::DirectorType::Fallback,
            "hash" => expr::DirectorType::Hash,
            "client" => expr::DirectorType::Client,
            "chash" => expr::DirectorType::ConsistentHash,
            invalid => {
                return Err(ParseError::at(
                    &type_tok,
                    format!("Invalid director type given: {}", invalid),
                ));
            }
        };

        self.consume(
            scanner::TokenType::LeftBrace,
            "Expected { before director body",
        )?;
        let body = self.director_block()?;

        Ok(expr::Director {
            name: Self::symbol(&name_tok, Some(expr::Type::Director)),
            body,
            director_type,
        })
    }

    fn director_block(&mut self) -> Result<expr::DirectorBody, ParseError> {
        let mut fields: Vec<String> = Vec::new();
        let mut builder = expr::DirectorBodyBuilder::default();
        let mut backends: Vec<expr::DirectorBackend> = Vec::new();

        while !self.check(scanner::TokenType::RightBrace) && !self.is_at_end() {
            if self.matches(scanner::TokenType::LeftBrace) {
                let backend = self.director_backend()?;
                backends.push(backend);
                self.consume(
                    scanner::TokenType::RightBrace,
                    "Expected } after director backend block",
                )?;
                continue;
            }

            let token = self.property_name("director")?;
            Self::check_duplicate(&mut fields, &token)?;
            match token.lexeme.as_str() {
                "retries" => {
                    builder.retries(self.primary()?);
                }
                "quorum" => {
                    let value = self.primary()?;
                    let value = match value {
                        expr::Expr::Literal(expr::Literal::Integer(n), loc)
                            if self.matches(scanner::TokenType::Percent) =>
                        {
                            expr::Expr::Literal(expr::Literal::Percent(n), loc)
                        }
                        other => other,
                    };
                    builder.quorum(value);
                }
                "key" => {
                    builder.key(self.primary()?);
                }
                "seed" => {
                    builder.seed(self.primary()?);
                }
                "vnodes_per_node" => {
                    builder.vnodes_per_node(self.primary()?);
                }
                _ => return Err(Self::unknown_property(&token)),
            }
            self.consume(
                scanner::TokenType::Semicolon,
                "Expected ; after director property value",
            )?;
        }
        builder.backends(backends);

        let closing = self
            .consume(
                scanner::TokenType::RightBrace,
                "Expected } after director block.",
            )?
            .clone();

        builder
            .build()
            .map_err(|err| ParseError::at(&closing, err.to_string()))
    }

    fn director_backend(&mut self) -> Result<expr::DirectorBackend, ParseError> {
        let mut fields = Vec::new();
        let mut builder = expr::DirectorBackendBuilder::default();

        while !self.check(scanner::TokenType::RightBrace) && !self.is_at_end() {
            let token = self.property_name("director backend")?;
            Self::check_duplicate(&mut fields, &token)?;
            match token.lexeme.as_str() {
                "id" => {
                    builder.id(self.primary()?);
                }
                "backend" => {
                    builder.backend(self.primary()?);
                }
                "weight" => {
                    builder.weight(self.primary()?);
                }
                _ => return Err(Self::unknown_property(&token)),
            }
            self.consume(
                scanner::TokenType::Semicolon,
                "Expected ; after director backend property value",
            )?;
        }

        let token = self.peek().clone();
        builder
            .build()
            .map_err(|err| ParseError::at(&token, err.to_string()))
    }

    fn backend_decl(&mut self) -> Result<expr::Backend, ParseError> {
        let name_tok = self
            .consume(scanner::TokenType::Identifier, "Expected backend name")?
            .clone();

        self.consume(
            scanner::TokenType::LeftBrace,
            "Expected { before backend body",
        )?;
        let body = self.backend_block()?;

        Ok(expr::Backend {
            name: Self::symbol(&name_tok, Some(expr::Type::Backend)),
            body,
        })
    }

    fn backend_block(&mut self) -> Result<expr::BackendBody, ParseError> {
        let mut fields = Vec::new();
        let mut builder = expr::BackendBodyBuilder::default();

        while !self.check(scanner::TokenType::RightBrace) && !self.is_at_end() {
            let token = self.property_name("backend")?;
            Self::check_duplicate(&mut fields, &token)?;
            if token.lexeme == "probe" {
                self.consume(
                    scanner::TokenType::LeftBrace,
                    "Expected { before probe block",
                )?;
                let value = self.probe()?;
                self.consume(
                    scanner::TokenType::RightBrace,
                    "Expected } after probe block",
                )?;
                // the trailing ; after a probe block is optional
                self.matches(scanner::TokenType::Semicolon);
                builder.probe(value);
                continue;
            }

            match token.lexeme.as_str() {
                "dynamic" => {
                    builder.dynamic(self.primary()?);
                }
                "share_key" => {
                    builder.share_key(self.primary()?);
                }
                "host" => {
                    builder.host(self.primary()?);
                }
                "port" => {
                    builder.port(self.primary()?);
                }
                "ssl" => {
                    builder.ssl(self.primary()?);
                }
                "ssl_cert_hostname" => {
                    builder.ssl_cert_hostname(self.primary()?);
                }
                "ssl_check_cert" => {
                    builder.ssl_check_cert(self.primary()?);
                }
                "ssl_sni_hostname" => {
                    builder.ssl_sni_hostname(self.primary()?);
                }
                "between_bytes_timeout" => {
                    builder.between_bytes_timeout(self.primary()?);
                }
                "connect_timeout" => {
                    builder.connect_timeout(self.primary()?);
                }
                "first_byte_timeout" => {
                    builder.first_byte_timeout(self.primary()?);
                }
                "max_connections" => {
                    builder.max_connections(self.primary()?);
                }
                "host_header" => {
                    builder.host_header(self.primary()?);
                }
                "always_use_host_header" => {
                    builder.always_use_host_header(self.primary()?);
                }
                _ => return Err(Self::unknown_property(&token)),
            }
            self.consume(
                scanner::TokenType::Semicolon,
                "Expected ; after backend property value",
            )?;
        }

        let closing = self
            .consume(
                scanner::TokenType::RightBrace,
                "Expected } after backend block.",
            )?
            .clone();

        builder
            .build()
            .map_err(|err| ParseError::at(&closing, err.to_string()))
    }

    fn probe(&mut self) -> Result<expr::Healthcheck, ParseError> {
        let mut fields = Vec::new();
        let mut builder = expr::HealthcheckBuilder::default();

        while !self.check(scanner::TokenType::RightBrace) && !self.is_at_end() {
            let token = self.property_name("probe")?;
            Self::check_duplicate(&mut fields, &token)?;
            match token.lexeme.as_str() {
                "dummy" => {
                    builder.dummy(self.primary()?);
                }
                "request" => {
                    builder.request(self.probe_request()?);
                }
                "expected_response" => {
                    builder.expected_response(self.primary()?);
                }
                "interval" => {
                    builder.interval(self.primary()?);
                }
                "timeout" => {
                    builder.timeout(self.primary()?);
                }
                "window" => {
                    builder.window(self.primary()?);
                }
                "initial" => {
                    builder.initial(self.primary()?);
                }
                "threshold" => {
                    builder.threshold(self.primary()?);
                }
                _ => return Err(Self::unknown_property(&token)),
            }
            self.consume(
                scanner::TokenType::Semicolon,
                "Expected ; after probe property value",
            )?;
        }

        let token = self.peek().clone();
        builder
            .build()
            .map_err(|err| ParseError::at(&token, err.to_string()))
    }

    /// `.request = "GET / HTTP/1.1" "Host: example.com";` is one line per string.
    fn probe_request(&mut self) -> Result<expr::Probe, ParseError> {
        let first = self
            .consume(
                scanner::TokenType::String,
                "Expected string for probe request",
            )?
            .clone();
        let mut lines = vec![Self::string_value(&first)];
        while self.matches(scanner::TokenType::String) {
            lines.push(Self::string_value(self.previous()));
        }

        let text = lines.join("\r\n");
        match parse_probe::parse_probe(&text) {
            Ok((_, probe)) => Ok(probe),
            Err(err) => Err(ParseError::at(
                &first,
                format!("Invalid probe request {:?}: {}", text, err),
            )),
        }
    }

    fn table_decl(&mut self) -> Result<expr::Table, ParseError> {
        let name_tok = self
            .consume(scanner::TokenType::Identifier, "Expected table name")?
            .clone();

        let value_type = if self.check(scanner::TokenType::Identifier) {
            let type_tok = self.advance().clone();
            match expr::Type::from_name(&type_tok.lexeme) {
                Some(ty) => Some(ty),
                None => {
                    return Err(ParseError::at(
                        &type_tok,
                        format!("Invalid table type: {}", type_tok.lexeme),
                    ))
                }
            }
        } else {
            None
        };

        self.consume(
            scanner::TokenType::LeftBrace,
            "Expected { before table body",
        )?;
        let body = self.table_block()?;

        Ok(expr::Table {
            name: Self::symbol(&name_tok, None),
            value_type,
            body,
        })
    }

    fn table_block(&mut self) -> Result<Vec<expr::TableEntry>, ParseError> {
        let mut entries = Vec::new();

        while !self.check(scanner::TokenType::RightBrace) && !self.is_at_end() {
            entries.push(self.table_entry()?)
        }

        self.consume(
            scanner::TokenType::RightBrace,
            "Expected } after table block.",
        )?;

        Ok(entries)
    }

    fn table_entry(&mut self) -> Result<expr::TableEntry, ParseError> {
        let key_tok = self
            .consume(
                scanner::TokenType::String,
                "Expected String for table-entry key.",
            )?
            .clone();
        self.consume(scanner::TokenType::Colon, "Expected : after table key")?;
        let value = self.unary()?;
        if self.check(scanner::TokenType::Comma) {
            self.advance();
        }

        Ok(expr::TableEntry {
            key: Self::string_value(&key_tok),
            value,
        })
    }

    fn sub_decl(&mut self) -> Result<expr::SubDecl, ParseError> {
        let name_tok = self
            .consume(scanner::TokenType::Identifier, "Expected subroutine name")?
            .clone();

        self.consume(
            scanner::TokenType::LeftBrace,
            "Expected { before subroutine body",
        )?;
        let body = self.block()?;

        Ok(expr::SubDecl {
            name: Self::symbol(&name_tok, None),
            body,
        })
    }

    fn statement(&mut self) -> Result<expr::Stmt, ParseError> {
        if self.matches(scanner::TokenType::Add) {
            return self.add_statement();
        }

        if self.matches(scanner::TokenType::Call) {
            return self.call_statement();
        }

        if self.matches(scanner::TokenType::Declare) {
            return self.declare_statement();
        }

        if self.matches(scanner::TokenType::Error) {
            return self.error_statement();
        }

        if self.matches(scanner::TokenType::Esi) {
            return self.esi_statement();
        }

        if self.matches(scanner::TokenType::Goto) {
            return self.goto_statement();
        }

        if self.matches(scanner::TokenType::HashData) {
            return self.hash_data_statement();
        }

        if self.matches(scanner::TokenType::If) {
            return self.if_statement();
        }

        if self.matches(scanner::TokenType::Log) {
            return self.log_statement();
        }

        if self.matches(scanner::TokenType::Remove) {
            return self.unset_statement();
        }

        if self.matches(scanner::TokenType::Restart) {
            return self.restart_statement();
        }

        if self.matches(scanner::TokenType::Return) {
            return self.return_statement();
        }

        if self.matches(scanner::TokenType::Set) {
            return self.set_statement();
        }

        if self.matches(scanner::TokenType::Synthetic) {
            return self.synthetic_statement();
        }

        if self.matches(scanner::TokenType::SyntheticBase64) {
            return self.synthetic_base64_statement();
        }

        if self.matches(scanner::TokenType::Unset) {
            return self.unset_statement();
        }

        if self.matches(scanner::TokenType::LeftBrace) {
            return Ok(expr::Stmt::Block(self.block()?));
        }

        if self.check(scanner::TokenType::Identifier)
            && self.peek_next_type() == scanner::TokenType::Colon
        {
            let label = self.advance().clone();
            self.advance();
            return Ok(expr::Stmt::Label(Self::symbol(&label, None)));
        }

        self.expression_statement()
    }

    fn declare_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let scope = self
            .consume(scanner::TokenType::Identifier, "Expected local after declare")?
            .clone();
        if scope.lexeme != "local" {
            return Err(ParseError::at(&scope, "Expected local after declare"));
        }

        let name_token = self
            .consume(scanner::TokenType::Identifier, "Expected variable name")?
            .clone();
        if !name_token.lexeme.starts_with("var.") {
            return Err(ParseError::at(&name_token, "Expected var. prefix"));
        }

        let type_token = self
            .consume(scanner::TokenType::Identifier, "Expected variable type")?
            .clone();
        let var_type = match expr::Type::from_name(&type_token.lexeme) {
            Some(ty) => ty,
            None => {
                return Err(ParseError::at(
                    &type_token,
                    format!("Invalid Type: {} - Needs to be one of ACL BACKEND BOOL FLOAT ID INTEGER IP RTIME STRING TIME", type_token.lexeme),
                ));
            }
        };

        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after variable declaration",
        )?;

        Ok(expr::Stmt::VarDecl(Self::symbol(&name_token, Some(var_type))))
    }

    fn call_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let identifier = self
            .consume(
                scanner::TokenType::Identifier,
                "Expected identifier after call statement.",
            )?
            .clone();
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after call statement",
        )?;

        Ok(expr::Stmt::Call(Self::symbol(&identifier, None)))
    }

    fn goto_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let label = self
            .consume(
                scanner::TokenType::Identifier,
                "Expected label after goto.",
            )?
            .clone();
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after goto statement",
        )?;

        Ok(expr::Stmt::Goto(Self::symbol(&label, None)))
    }

    fn esi_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let location = Self::location(self.previous());
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after esi statement",
        )?;

        Ok(expr::Stmt::Esi(location))
    }

    fn hash_data_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        self.consume(
            scanner::TokenType::LeftParen,
            "Expected ( after hash_data.",
        )?;
        let value = self.expression()?;
        self.consume(
            scanner::TokenType::RightParen,
            "Expected ) after hash_data value.",
        )?;
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after hash_data statement",
        )?;

        Ok(expr::Stmt::HashData(value))
    }

    fn target(&mut self, statement: &str) -> Result<expr::Expr, ParseError> {
        let token = self
            .consume(
                scanner::TokenType::Identifier,
                &format!("Expected variable name after {}.", statement),
            )?
            .clone();
        Ok(expr::Expr::Variable(Self::symbol(&token, None)))
    }

    fn add_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let identifier = self.target("add")?;
        self.consume(
            scanner::TokenType::Equal,
            "Expected = after add statement variable name.",
        )?;
        let value = self.expression()?;
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after add statement",
        )?;

        Ok(expr::Stmt::Add(identifier, value))
    }

    fn synthetic_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let value = self.expression()?;
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after synthetic statement",
        )?;

        Ok(expr::Stmt::Synthetic(value))
    }

    fn synthetic_base64_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let value = self.expression()?;
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after synthetic.base64 statement",
        )?;

        Ok(expr::Stmt::SyntheticBase64(value))
    }

    fn unset_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let identifier = self.target("unset")?;
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after unset statement",
        )?;

        Ok(expr::Stmt::Unset(identifier))
    }

    fn set_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let identifier = self.target("set")?;
        if !self.match_one_of(&[
            scanner::TokenType::Equal,
            scanner::TokenType::Subtraction,
            scanner::TokenType::Addition,
            scanner::TokenType::Multiplication,
            scanner::TokenType::Division,
            scanner::TokenType::Modulus,
            scanner::TokenType::BitwiseOr,
            scanner::TokenType::BitwiseAnd,
            scanner::TokenType::BitwiseXor,
            scanner::TokenType::LeftShift,
            scanner::TokenType::RightShift,
            scanner::TokenType::LeftRotate,
            scanner::TokenType::RightRotate,
            scanner::TokenType::LogicalAnd,
            scanner::TokenType::LogicalOr,
        ]) {
            return Err(ParseError::at(
                self.peek(),
                format!(
                    "invalid assignment operator {:?} in set statement",
                    self.peek().ty
                ),
            ));
        }

        let token = self.previous().clone();
        let assignment_type = match token.ty {
            scanner::TokenType::Addition => expr::Assignment::Addition,
            scanner::TokenType::Subtraction => expr::Assignment::Subtraction,
            scanner::TokenType::Multiplication => expr::Assignment::Multiplication,
            scanner::TokenType::Division => expr::Assignment::Division,
            scanner::TokenType::Modulus => expr::Assignment::Modulus,
            scanner::TokenType::BitwiseOr => expr::Assignment::BitwiseOr,
            scanner::TokenType::BitwiseAnd => expr::Assignment::BitwiseAnd,
            scanner::TokenType::BitwiseXor => expr::Assignment::BitwiseXor,
            scanner::TokenType::LeftShift => expr::Assignment::LeftShift,
            scanner::TokenType::RightShift => expr::Assignment::RightShift,
            scanner::TokenType::LeftRotate => expr::Assignment::LeftRotate,
            scanner::TokenType::RightRotate => expr::Assignment::RightRotate,
            scanner::TokenType::LogicalAnd => expr::Assignment::LogicalAnd,
            scanner::TokenType::LogicalOr => expr::Assignment::LogicalOr,
            _ => expr::Assignment::Assign,
        };
        let value = self.expression()?;

        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after set statement",
        )?;

        Ok(expr::Stmt::Set(identifier, assignment_type, value))
    }

    /// `error;`, `error 404;`, `error 404 "msg";` or `error(404, "msg");`
    fn error_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let location = Self::location(self.previous());
        let mut status = None;
        let mut message = None;
        if self.matches(scanner::TokenType::LeftParen) {
            if !self.check(scanner::TokenType::RightParen) {
                status = Some(self.expression()?);
                if self.matches(scanner::TokenType::Comma) {
                    message = Some(self.expression()?);
                }
            }
            self.consume(
                scanner::TokenType::RightParen,
                "Expected ) after error arguments",
            )?;
        } else if !self.check(scanner::TokenType::Semicolon) {
            status = Some(self.unary()?);
            if !self.check(scanner::TokenType::Semicolon) {
                message = Some(self.expression()?);
            }
        }
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after error statement",
        )?;

        Ok(expr::Stmt::Error(expr::Error { status, message }, location))
    }

    fn restart_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let location = Self::location(self.previous());

        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after restart statement",
        )?;

        Ok(expr::Stmt::Restart(location))
    }

    fn return_action(&mut self) -> Result<expr::Symbol, ParseError> {
        let token = self.peek().clone();
        match token.ty {
            scanner::TokenType::Identifier
            | scanner::TokenType::Error
            | scanner::TokenType::Restart => {}
            _ => {
                return Err(ParseError::at(
                    &token,
                    "Expected identifier after return statement.",
                ))
            }
        }
        self.advance();
        if !RETURN_ACTIONS.contains(&token.lexeme.as_str()) {
            return Err(ParseError::at(
                &token,
                format!(
                    "Found {} - Expected one of {}",
                    token.lexeme,
                    RETURN_ACTIONS.join(", ")
                ),
            ));
        }
        Ok(Self::symbol(&token, None))
    }

    fn return_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let location = Self::location(self.previous());

        let maybe_retval = if self.matches(scanner::TokenType::Semicolon) {
            return Ok(expr::Stmt::Return(location, None));
        } else if self.matches(scanner::TokenType::LeftParen) {
            let action = self.return_action()?;
            self.consume(
                scanner::TokenType::RightParen,
                "Expected right paren after return statement state.",
            )?;
            action
        } else {
            self.return_action()?
        };
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after return value",
        )?;

        Ok(expr::Stmt::Return(location, Some(maybe_retval)))
    }

    fn log_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let expr = self.expression()?;
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after log statement",
        )?;

        Ok(expr::Stmt::Log(expr))
    }

    fn if_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        self.consume(scanner::TokenType::LeftParen, "Expected ( after if.")?;
        let cond = self.expression()?;
        self.consume(
            scanner::TokenType::RightParen,
            "Expected ) after if condition.",
        )?;
        let then_branch = Box::new(self.statement()?);
        let maybe_else_branch = if self.matches(scanner::TokenType::Else) {
            Some(Box::new(self.statement()?))
        } else if self.matches(scanner::TokenType::ElseIf) {
            Some(Box::new(self.if_statement()?))
        } else {
            None
        };

        Ok(expr::Stmt::If(cond, then_branch, maybe_else_branch))
    }

    fn block(&mut self) -> Result<Vec<expr::Stmt>, ParseError> {
        let mut stmts = Vec::new();

        while !self.check(scanner::TokenType::RightBrace) && !self.is_at_end() {
            stmts.push(self.statement()?)
        }

        self.consume(scanner::TokenType::RightBrace, "Expected } after block.")?;

        Ok(stmts)
    }

    fn expression_statement(&mut self) -> Result<expr::Stmt, ParseError> {
        let expr = self.expression()?;
        self.consume(
            scanner::TokenType::Semicolon,
            "Expected ; after expression/statement",
        )?;
        Ok(expr::Stmt::Expr(expr))
    }

    fn expression(&mut self) -> Result<expr::Expr, ParseError> {
        self.ternary()
    }

    fn ternary(&mut self) -> Result<expr::Expr, ParseError> {
        let cond = self.or()?;

        if self.matches(scanner::TokenType::Question) {
            let location = Self::location(self.previous());
            let then = self.expression()?;
            self.consume(
                scanner::TokenType::Colon,
                "Expected : in conditional expression.",
            )?;
            let else_branch = self.expression()?;
            return Ok(expr::Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(else_branch),
                location,
            ));
        }

        Ok(cond)
    }

    fn or(&mut self) -> Result<expr::Expr, ParseError> {
        let mut expr = self.and()?;

        while self.matches(scanner::TokenType::Or) {
            let right = self.and()?;
            expr = expr::Expr::Logical(Box::new(expr), expr::LogicalOp::Or, Box::new(right));
        }

        Ok(expr)
    }

    fn and(&mut self) -> Result<expr::Expr, ParseError> {
        let mut expr = self.equality()?;

        while self.matches(scanner::TokenType::And) {
            let right = self.equality()?;
            expr = expr::Expr::Logical(Box::new(expr), expr::LogicalOp::And, Box::new(right));
        }

        Ok(expr)
    }

    fn equality(&mut self) -> Result<expr::Expr, ParseError> {
        let mut expr = self.comparison()?;

        while self.match_one_of(&[
            scanner::TokenType::BangEqual,
            scanner::TokenType::EqualEqual,
        ]) {
            let binop = Self::op_token_to_binop(self.previous())?;
            let right = Box::new(self.comparison()?);
            expr = expr::Expr::Binary(Box::new(expr), binop, right);
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<expr::Expr, ParseError> {
        let mut expr = self.match_regex_or_acl()?;

        while self.match_one_of(&[
            scanner::TokenType::Greater,
            scanner::TokenType::GreaterEqual,
            scanner::TokenType::Less,
            scanner::TokenType::LessEqual,
        ]) {
            let binop = Self::op_token_to_binop(self.previous())?;
            let right = Box::new(self.match_regex_or_acl()?);
            expr = expr::Expr::Binary(Box::new(expr), binop, right);
        }
        Ok(expr)
    }

    fn match_regex_or_acl(&mut self) -> Result<expr::Expr, ParseError> {
        let mut expr = self.addition()?;

        while self.match_one_of(&[scanner::TokenType::BangTilde, scanner::TokenType::Tilde]) {
            let binop = Self::op_token_to_binop(self.previous())?;
            let right = match self.addition()? {
                expr::Expr::Literal(expr::Literal::String(pattern), loc) => {
                    expr::Expr::Regex(pattern, loc)
                }
                other => other,
            };
            expr = expr::Expr::Binary(Box::new(expr), binop, Box::new(right));
        }
        Ok(expr)
    }

    fn addition(&mut self) -> Result<expr::Expr, ParseError> {
        let mut expr = self.multiplication()?;

        while self.match_one_of(&[scanner::TokenType::Plus, scanner::TokenType::Minus]) {
            let binop = Self::op_token_to_binop(self.previous())?;
            let right = Box::new(self.multiplication()?);
            expr = expr::Expr::Binary(Box::new(expr), binop, right);
        }
        Ok(expr)
    }

    fn multiplication(&mut self) -> Result<expr::Expr, ParseError> {
        let mut expr = self.concatenation()?;

        while self.match_one_of(&[
            scanner::TokenType::Star,
            scanner::TokenType::Slash,
            scanner::TokenType::Percent,
        ]) {
            let binop = Self::op_token_to_binop(self.previous())?;
            let right = Box::new(self.concatenation()?);
            expr = expr::Expr::Binary(Box::new(expr), binop, right);
        }
        Ok(expr)
    }

    fn starts_operand(&self) -> bool {
        matches!(
            self.peek().ty,
            scanner::TokenType::String
                | scanner::TokenType::Integer
                | scanner::TokenType::Float
                | scanner::TokenType::Identifier
                | scanner::TokenType::True
                | scanner::TokenType::False
                | scanner::TokenType::If
        )
    }

    /// Adjacent operands with no operator between them concatenate.
    fn concatenation(&mut self) -> Result<expr::Expr, ParseError> {
        let mut expr = self.unary()?;

        while !self.is_at_end() && self.starts_operand() {
            let token = self.peek().clone();
            let right = Box::new(self.unary()?);
            expr = expr::Expr::Binary(
                Box::new(expr),
                expr::BinaryOp {
                    ty: expr::BinaryOpTy::Concat,
                    line: token.line,
                    col: token.col,
                },
                right,
            );
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<expr::Expr, ParseError> {
        if self.match_one_of(&[scanner::TokenType::Bang, scanner::TokenType::Minus]) {
            let unary_op = Self::op_token_to_unary_op(self.previous())?;
            let right = Box::new(self.unary()?);
            return Ok(expr::Expr::Unary(unary_op, right));
        }
        self.call()
    }

    fn call(&mut self) -> Result<expr::Expr, ParseError> {
        let mut expr = if self.check(scanner::TokenType::Identifier)
            && self.peek_next_type() == scanner::TokenType::LeftParen
        {
            let callee = self.advance().clone();
            self.advance();
            self.finish_call(Self::symbol(&callee, None))?
        } else {
            self.primary()?
        };

        while self.matches(scanner::TokenType::Dot) {
            let name_token = self.peek().clone();
            match name_token.ty {
                scanner::TokenType::Integer | scanner::TokenType::Identifier => {}
                _ => {
                    return Err(ParseError::at(
                        &name_token,
                        "Expected property name after '.'.",
                    ));
                }
            }
            self.advance();
            expr = expr::Expr::Get(Box::new(expr), Self::symbol(&name_token, None));
        }
        Ok(expr)
    }

    fn finish_call(&mut self, callee: expr::Symbol) -> Result<expr::Expr, ParseError> {
        let mut arguments = Vec::new();

        if !self.check(scanner::TokenType::RightParen) {
            loop {
                if arguments.len() >= 255 {
                    return Err(ParseError::at(
                        self.peek(),
                        "Cannot have more than 255 arguments to a function call.",
                    ));
                }
                arguments.push(self.expression()?);
                if !self.matches(scanner::TokenType::Comma) {
                    break;
                }
            }
        }

        self.consume(
            scanner::TokenType::RightParen,
            "Expected ) after arguments.",
        )?;

        Ok(expr::Expr::Call(callee, arguments))
    }

    fn if_expr(&mut self) -> Result<expr::Expr, ParseError> {
        let location = Self::location(self.previous());
        self.consume(scanner::TokenType::LeftParen, "Expected ( after if.")?;
        let cond = self.expression()?;
        self.consume(
            scanner::TokenType::Comma,
            "Expected comma after if function condition.",
        )?;
        let then = self.expression()?;
        self.consume(
            scanner::TokenType::Comma,
            "Expected comma after if function then value.",
        )?;
        let else_branch = self.expression()?;

        self.consume(
            scanner::TokenType::RightParen,
            "Expected ')' after if function.",
        )?;

        Ok(expr::Expr::Ternary(
            Box::new(cond),
            Box::new(then),
            Box::new(else_branch),
            location,
        ))
    }

    fn primary(&mut self) -> Result<expr::Expr, ParseError> {
        let token = self.peek().clone();
        let location = Self::location(&token);
        let literal = match token.ty {
            scanner::TokenType::False => expr::Literal::False,
            scanner::TokenType::True => expr::Literal::True,
            scanner::TokenType::Integer => match token.literal {
                Some(scanner::Literal::Integer(n)) => expr::Literal::Integer(n),
                _ => return Err(ParseError::at(&token, "malformed integer literal")),
            },
            scanner::TokenType::Float => match token.literal {
                Some(scanner::Literal::Float(n)) => expr::Literal::Float(n),
                _ => return Err(ParseError::at(&token, "malformed float literal")),
            },
            scanner::TokenType::String => expr::Literal::String(Self::string_value(&token)),
            scanner::TokenType::Identifier => {
                self.advance();
                return Ok(expr::Expr::Variable(Self::symbol(&token, None)));
            }
            scanner::TokenType::LeftParen => {
                self.advance();
                let expr = Box::new(self.expression()?);
                self.consume(
                    scanner::TokenType::RightParen,
                    "Expected ')' after expression.",
                )?;
                return Ok(expr::Expr::Grouping(expr));
            }
            scanner::TokenType::If => {
                self.advance();
                return self.if_expr();
            }
            _ => {
                return Err(ParseError::at(
                    &token,
                    format!("Expected expression, but found token {:?}", token.ty),
                ))
            }
        };
        self.advance();
        Ok(expr::Expr::Literal(literal, location))
    }

    fn consume(
        &mut self,
        tok: scanner::TokenType,
        on_err_str: &str,
    ) -> Result<&scanner::Token, ParseError> {
        if self.check(tok) {
            return Ok(self.advance());
        }
        let found = self.peek();
        Err(ParseError::at(
            found,
            format!(
                "Expected token {:?} but found {:?}: {}",
                tok, found.ty, on_err_str
            ),
        ))
    }

    fn op_token_to_unary_op(tok: &scanner::Token) -> Result<expr::UnaryOp, ParseError> {
        let ty = match tok.ty {
            scanner::TokenType::Bang => expr::UnaryOpTy::Bang,
            scanner::TokenType::Minus => expr::UnaryOpTy::Minus,
            _ => {
                return Err(ParseError::at(
                    tok,
                    format!("invalid token in unary op {:?}", tok.ty),
                ))
            }
        };
        Ok(expr::UnaryOp {
            ty,
            line: tok.line,
            col: tok.col,
        })
    }

    fn op_token_to_binop(tok: &scanner::Token) -> Result<expr::BinaryOp, ParseError> {
        let ty = match tok.ty {
            scanner::TokenType::EqualEqual => expr::BinaryOpTy::EqualEqual,
            scanner::TokenType::BangEqual => expr::BinaryOpTy::NotEqual,
            scanner::TokenType::BangTilde => expr::BinaryOpTy::NotMatch,
            scanner::TokenType::Tilde => expr::BinaryOpTy::Match,
            scanner::TokenType::Less => expr::BinaryOpTy::Less,
            scanner::TokenType::LessEqual => expr::BinaryOpTy::LessEqual,
            scanner::TokenType::Greater => expr::BinaryOpTy::Greater,
            scanner::TokenType::GreaterEqual => expr::BinaryOpTy::GreaterEqual,
            scanner::TokenType::Plus => expr::BinaryOpTy::Plus,
            scanner::TokenType::Minus => expr::BinaryOpTy::Minus,
            scanner::TokenType::Star => expr::BinaryOpTy::Star,
            scanner::TokenType::Slash => expr::BinaryOpTy::Slash,
            scanner::TokenType::Percent => expr::BinaryOpTy::Percent,
            _ => {
                return Err(ParseError::at(
                    tok,
                    format!("invalid token in binary op {:?}", tok.ty),
                ))
            }
        };
        Ok(expr::BinaryOp {
            ty,
            line: tok.line,
            col: tok.col,
        })
    }

    fn match_one_of(&mut self, types: &[scanner::TokenType]) -> bool {
        for ty in types {
            if self.matches(*ty) {
                return true;
            }
        }
        false
    }

    fn matches(&mut self, ty: scanner::TokenType) -> bool {
        if self.check(ty) {
            self.advance();
            return true;
        }
        false
    }

    fn check(&self, ty: scanner::TokenType) -> bool {
        if self.is_at_end() {
            return false;
        }

        self.peek().ty == ty
    }

    fn peek_next_type(&self) -> scanner::TokenType {
        match self.tokens.get(self.current + 1) {
            Some(token) => token.ty,
            None => scanner::TokenType::Eof,
        }
    }

    fn advance(&mut self) -> &scanner::Token {
        if !self.is_at_end() {
            self.current += 1
        }

        self.previous()
    }

    fn is_at_end(&self) -> bool {
        self.peek().ty == scanner::TokenType::Eof
    }

    fn peek(&self) -> &scanner::Token {
        let last = self.tokens.len() - 1;
        &self.tokens[self.current.min(last)]
    }

    fn previous(&self) -> &scanner::Token {
        &self.tokens[self.current.saturating_sub(1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{BinaryOpTy, Declaration, Expr, Literal, LogicalOp, Stmt};
    use crate::scanner::scan_tokens;

    fn parse_src(src: &str) -> Result<expr::Program, ParseError> {
        parse(scan_tokens(src))
    }

    fn recv_body(src: &str) -> Vec<Stmt> {
        let program = parse_src(&format!("sub vcl_recv {{ {} }}", src)).unwrap();
        match program.body.into_iter().next() {
            Some(Declaration::SubDecl(sub)) => sub.body,
            other => panic!("expected sub, got {:?}", other),
        }
    }

    fn set_value(src: &str) -> Expr {
        match recv_body(src).into_iter().next() {
            Some(Stmt::Set(_, _, value)) => value,
            other => panic!("expected set, got {:?}", other),
        }
    }

    fn binary_ty(expr: &Expr) -> BinaryOpTy {
        match expr {
            Expr::Binary(_, op, _) => op.ty,
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[test]
    fn test_declarations() {
        let program = parse_src(
            r#"
            include "shared.vcl";
            import boltsort;
            acl internal { "192.168.0.0"/16; !"192.168.1.1"; "10.0.0.1"; }
            backend F_origin {
                .host = "example.com";
                .port = "443";
                .ssl = true;
                .connect_timeout = 1s;
                .probe = {
                    .request = "HEAD / HTTP/1.1" "Host: example.com" "Connection: close";
                    .expected_response = 200;
                    .interval = 5s;
                    .window = 5;
                    .threshold = 3;
                    .initial = 4;
                }
            }
            director main_director random {
                .quorum = 50%;
                .retries = 3;
                { .backend = F_origin; .weight = 2; }
            }
            table routes INTEGER { "a": 1, "b": -2 }
            sub vcl_recv { return(lookup); }
            "#,
        )
        .unwrap();
        assert_eq!(program.body.len(), 7);

        match &program.body[2] {
            Declaration::Acl(acl) => {
                assert_eq!(acl.name.name, "internal");
                assert_eq!(acl.body.len(), 3);
                assert_eq!(acl.body[0].prefix, Some(16));
                assert!(acl.body[1].negated);
                assert_eq!(acl.body[2].prefix, None);
            }
            other => panic!("expected acl, got {:?}", other),
        }

        match &program.body[3] {
            Declaration::Backend(backend) => {
                let probe = backend.body.probe.as_ref().unwrap();
                let request = probe.request.as_ref().unwrap();
                assert_eq!(request.path, "/");
                assert_eq!(
                    request.headers,
                    vec![
                        ("Host".to_string(), "example.com".to_string()),
                        ("Connection".to_string(), "close".to_string())
                    ]
                );
                assert_eq!(
                    backend.body.connect_timeout,
                    Some(Expr::Literal(
                        Literal::String("1s".to_string()),
                        expr::SourceLocation { line: 9, col: 36 }
                    ))
                );
            }
            other => panic!("expected backend, got {:?}", other),
        }

        match &program.body[4] {
            Declaration::Director(director) => {
                assert_eq!(director.director_type, expr::DirectorType::Random);
                assert!(matches!(
                    director.body.quorum,
                    Some(Expr::Literal(Literal::Percent(50), _))
                ));
                assert_eq!(director.body.backends.len(), 1);
            }
            other => panic!("expected director, got {:?}", other),
        }

        match &program.body[5] {
            Declaration::Table(table) => {
                assert_eq!(table.value_type, Some(expr::Type::Integer));
                assert_eq!(table.body.len(), 2);
                assert_eq!(table.body[1].key, "b");
            }
            other => panic!("expected table, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let value = set_value("set var.x = a || b && c == d;");
        match &value {
            Expr::Logical(_, LogicalOp::Or, rhs) => match rhs.as_ref() {
                Expr::Logical(_, LogicalOp::And, rhs) => {
                    assert_eq!(binary_ty(rhs), BinaryOpTy::EqualEqual)
                }
                other => panic!("expected and, got {:?}", other),
            },
            other => panic!("expected or, got {:?}", other),
        }

        let value = set_value("set var.x = 1 + 2 * 3;");
        match &value {
            Expr::Binary(_, op, rhs) => {
                assert_eq!(op.ty, BinaryOpTy::Plus);
                assert_eq!(binary_ty(rhs), BinaryOpTy::Star);
            }
            other => panic!("expected binary, got {:?}", other),
        }

        // comparison binds looser than the match operator
        let value = set_value("set var.x = req.url ~ \"a\" == true;");
        match &value {
            Expr::Binary(lhs, op, _) => {
                assert_eq!(op.ty, BinaryOpTy::EqualEqual);
                assert_eq!(binary_ty(lhs), BinaryOpTy::Match);
            }
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[test]
    fn test_implicit_concatenation() {
        let value = set_value("set req.http.X = \"a\" req.url \"b\";");
        match &value {
            Expr::Binary(lhs, op, _) => {
                assert_eq!(op.ty, BinaryOpTy::Concat);
                assert_eq!(binary_ty(lhs), BinaryOpTy::Concat);
            }
            other => panic!("expected concat, got {:?}", other),
        }
    }

    #[test]
    fn test_regex_literal_and_ternary() {
        let body = recv_body("if (req.url ~ \"^/api/\") { set var.x = req.restarts > 0 ? \"a\" : \"b\"; }");
        match &body[0] {
            Stmt::If(Expr::Binary(_, op, rhs), then, None) => {
                assert_eq!(op.ty, BinaryOpTy::Match);
                assert!(matches!(rhs.as_ref(), Expr::Regex(p, _) if p == "^/api/"));
                match then.as_ref() {
                    Stmt::Block(stmts) => {
                        assert!(matches!(&stmts[0], Stmt::Set(_, _, Expr::Ternary(..))))
                    }
                    other => panic!("expected block, got {:?}", other),
                }
            }
            other => panic!("expected if, got {:?}", other),
        }

        let value = set_value("set var.x = if(req.http.a, \"y\", \"n\");");
        assert!(matches!(value, Expr::Ternary(..)));
    }

    #[test]
    fn test_statements() {
        let body = recv_body(
            r#"
            declare local var.count INTEGER;
            set var.count += 1;
            unset req.http.Cookie;
            remove req.http.X;
            add resp.http.Set-Cookie = "a=1";
            hash_data(req.url);
            error 404 "Not Found";
            error(503);
            synthetic {"<h1>hi</h1>"};
            log "hello " req.url;
            std.log("x");
            call my_sub;
            goto done;
            done:
            esi;
            restart;
            return pass;
            "#,
        );
        assert!(matches!(&body[0], Stmt::VarDecl(sym) if sym.name == "var.count" && sym.var_type == Some(expr::Type::Integer)));
        assert!(matches!(&body[1], Stmt::Set(_, expr::Assignment::Addition, _)));
        assert!(matches!(&body[2], Stmt::Unset(_)));
        assert!(matches!(&body[3], Stmt::Unset(_)));
        assert!(matches!(&body[4], Stmt::Add(_, _)));
        assert!(matches!(&body[5], Stmt::HashData(_)));
        assert!(matches!(
            &body[6],
            Stmt::Error(expr::Error { status: Some(_), message: Some(_) }, _)
        ));
        assert!(matches!(
            &body[7],
            Stmt::Error(expr::Error { status: Some(_), message: None }, _)
        ));
        assert!(matches!(&body[8], Stmt::Synthetic(_)));
        assert!(matches!(&body[9], Stmt::Log(Expr::Binary(..))));
        assert!(matches!(&body[10], Stmt::Expr(Expr::Call(sym, args)) if sym.name == "std.log" && args.len() == 1));
        assert!(matches!(&body[11], Stmt::Call(sym) if sym.name == "my_sub"));
        assert!(matches!(&body[12], Stmt::Goto(sym) if sym.name == "done"));
        assert!(matches!(&body[13], Stmt::Label(sym) if sym.name == "done"));
        assert!(matches!(&body[14], Stmt::Esi(_)));
        assert!(matches!(&body[15], Stmt::Restart(_)));
        assert!(matches!(&body[16], Stmt::Return(_, Some(sym)) if sym.name == "pass"));
    }

    #[test]
    fn test_else_if_chains() {
        let body = recv_body(
            "if (a) { set x = 1; } else if (b) { set x = 2; } elsif (c) { set x = 3; } else { set x = 4; }",
        );
        match &body[0] {
            Stmt::If(_, _, Some(else_branch)) => match else_branch.as_ref() {
                Stmt::If(_, _, Some(inner)) => assert!(matches!(inner.as_ref(), Stmt::If(_, _, Some(_)))),
                other => panic!("expected else if, got {:?}", other),
            },
            other => panic!("expected if, got {:?}", other),
        }

        let body = recv_body("if (a) set x = 1; else set x = 2;");
        assert!(matches!(&body[0], Stmt::If(_, _, Some(_))));
    }

    #[test]
    fn test_return_forms() {
        let body = recv_body("return(error); return restart; return;");
        assert!(matches!(&body[0], Stmt::Return(_, Some(sym)) if sym.name == "error"));
        assert!(matches!(&body[1], Stmt::Return(_, Some(sym)) if sym.name == "restart"));
        assert!(matches!(&body[2], Stmt::Return(_, None)));

        let err = parse_src("sub vcl_recv { return(bogus); }").unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 23);
    }

    #[test]
    fn test_parse_error_location() {
        let err = parse_src("sub vcl_recv {\n  set req.http.a \"x\";\n}").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 18);
        assert!(err.to_string().ends_with("at line=2,col=18"));

        assert!(parse_src("set x = 1;").is_err());
        assert!(parse_src("sub vcl_recv { set x = ; }").is_err());
    }

    #[test]
    fn test_parse_is_deterministic() {
        let src = "sub vcl_recv { if (req.http.host == \"a\") { set req.backend = F; } }";
        assert_eq!(parse_src(src), parse_src(src));
    }
}
