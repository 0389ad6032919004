//! # SQL front end
//!
//! Parses SQL text with `sqlparser`, binds it against a catalog into a logical `Query`,
//! and, when the query reads sensitive tables, validates and rewrites it
//! into an anonymizing query.
//!

pub mod bind;

use crate::{
    ast,
    config::{AccessLevel, Config},
    query::{self, link::AnonQueryLinks, rewrite, Catalog, Query},
};
use sqlparser::{
    dialect::{Dialect, GenericDialect},
    parser::{Parser, ParserError},
    tokenizer::{Tokenizer, TokenizerError},
};
use std::{error, fmt, result};

pub use bind::bind;

// Error management

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ParsingError(String),
    Query(query::Error),
    Other(String),
}

impl Error {
    pub fn parsing_error(input: impl fmt::Display) -> Error {
        Error::ParsingError(format!("Cannot parse {}", input))
    }
    pub fn other<T: fmt::Display>(desc: T) -> Error {
        Error::Other(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ParsingError(input) => writeln!(f, "ParsingError: {}", input),
            Error::Query(err) => write!(f, "{}", err),
            Error::Other(err) => writeln!(f, "{}", err),
        }
    }
}

impl error::Error for Error {}

impl From<TokenizerError> for Error {
    fn from(err: TokenizerError) -> Self {
        Error::ParsingError(err.to_string())
    }
}
impl From<ParserError> for Error {
    fn from(err: ParserError) -> Self {
        Error::ParsingError(err.to_string())
    }
}
impl From<query::Error> for Error {
    fn from(err: query::Error) -> Self {
        Error::Query(err)
    }
}

pub type Result<T> = result::Result<T, Error>;

/// A SQL query parser with dialect
pub fn parse_with_dialect<D: Dialect>(query: &str, dialect: D) -> Result<ast::Query> {
    let mut tokenizer = Tokenizer::new(&dialect, query);
    let tokens = tokenizer.tokenize()?;
    let mut parser = Parser::new(&dialect).with_tokens(tokens);
    let query = parser.parse_query()?;
    Ok(query)
}

/// Parse a SQL query
pub fn parse(query: &str) -> Result<ast::Query> {
    parse_with_dialect(query, GenericDialect)
}

/// A bound query, rewritten when it had to be anonymized
#[derive(Clone, Debug, PartialEq)]
pub struct AnonymizedQuery {
    pub query: Query,
    /// Empty when the query is not anonymizing
    pub links: AnonQueryLinks,
}

impl AnonymizedQuery {
    pub fn is_anonymizing(&self) -> bool {
        !self.links.is_empty()
    }
}

/// Parse, bind and, if needed, rewrite a query for a user with the given access level
pub fn anonymize_with_access_level(
    sql: &str,
    catalog: &Catalog,
    config: &Config,
    access_level: Option<AccessLevel>,
) -> Result<AnonymizedQuery> {
    let mut query = bind(&parse(sql)?, catalog)?;
    let relations = catalog.sensitive_relations()?;
    let links = if config.requires_anonymization(access_level)
        && rewrite::is_sensitive_query(&query, &relations)
    {
        log::debug!("Anonymizing query: {}", query);
        rewrite::compile_anonymizing_query(&mut query, &relations, config)?
    } else {
        AnonQueryLinks::new()
    };
    Ok(AnonymizedQuery { query, links })
}

/// Parse, bind and, if needed, rewrite a query with the default access level
pub fn anonymize(sql: &str, catalog: &Catalog, config: &Config) -> Result<AnonymizedQuery> {
    anonymize_with_access_level(sql, catalog, config, None)
}
