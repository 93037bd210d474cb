//! Typed expression tree for the SELECT subset the validator reasons about.
//!
//! `sqlparser` produces a very wide AST; [`parse_select`] lowers it into a
//! closed set of node kinds so every rule can match exhaustively. Anything the
//! validator does not need to look inside is kept as [`SqlExpr::Opaque`] text.
//! Nested queries are never lowered further: their presence is the violation.

use sqlparser::ast as sql;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SqlError {
    #[error("Invalid SQL syntax: {0}")]
    Syntax(String),
    #[error("Expected exactly one statement, found {0}")]
    StatementCount(usize),
    #[error("Only SELECT queries are allowed")]
    NotAQuery,
    #[error("Set operations (UNION, INTERSECT, EXCEPT) are not supported")]
    SetOperation,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SelectStatement {
    pub projection: Vec<SelectItem>,
    pub from: Vec<Relation>,
    pub selection: Option<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub group_by_all: bool,
    pub having: Option<SqlExpr>,
    /// `WITH` bindings; each one is a nested query.
    pub ctes: Vec<SubQuery>,
}

impl SelectStatement {
    pub fn has_group_by(&self) -> bool {
        self.group_by_all || !self.group_by.is_empty()
    }

    /// Name of the first plain table referenced in `FROM`, if any.
    pub fn primary_table(&self) -> Option<&str> {
        self.from.iter().find_map(Relation::table_name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SelectItem {
    Wildcard { qualifier: Option<String> },
    Expr { expr: SqlExpr, alias: Option<String> },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Relation {
    Table { name: String },
    SubSelect(SubQuery),
    Nested(Vec<Relation>),
    Other(String),
}

impl Relation {
    fn table_name(&self) -> Option<&str> {
        match self {
            Relation::Table { name } => Some(name),
            Relation::Nested(inner) => inner.iter().find_map(Relation::table_name),
            Relation::SubSelect(_) | Relation::Other(_) => None,
        }
    }
}

/// A nested query, kept as its canonical SQL text.
#[derive(Clone, Debug, PartialEq)]
pub struct SubQuery {
    pub text: String,
}

impl SubQuery {
    fn from_query(query: &sql::Query) -> Self {
        Self {
            text: query.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Number(f64),
    String(String),
    Boolean(bool),
    Null,
    Other(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum BinaryOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Other(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoolOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionCall {
    /// Upper-cased, unqualified function name.
    pub name: String,
    pub args: Vec<SqlExpr>,
    pub windowed: bool,
}

impl FunctionCall {
    pub fn is_count_star(&self) -> bool {
        self.name == "COUNT"
            && (self.args.is_empty() || matches!(self.args.as_slice(), [SqlExpr::Wildcard]))
    }

    /// Unqualified column of a single-argument call, `None` for `*`.
    pub fn column_argument(&self) -> Option<String> {
        match self.args.as_slice() {
            [SqlExpr::Column(name)] => Some(
                name.rsplit('.')
                    .next()
                    .unwrap_or(name.as_str())
                    .to_owned(),
            ),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SqlExpr {
    Column(String),
    Literal(Literal),
    Wildcard,
    FunctionCall(FunctionCall),
    BinaryOp {
        left: Box<SqlExpr>,
        op: BinaryOperator,
        right: Box<SqlExpr>,
    },
    /// Flattened AND/OR chain.
    BoolOp {
        op: BoolOperator,
        operands: Vec<SqlExpr>,
    },
    UnaryOp {
        op: String,
        expr: Box<SqlExpr>,
    },
    SubSelect(SubQuery),
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
    Between {
        expr: Box<SqlExpr>,
        low: Box<SqlExpr>,
        high: Box<SqlExpr>,
        negated: bool,
    },
    IsNull {
        expr: Box<SqlExpr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<SqlExpr>>,
        branches: Vec<(SqlExpr, SqlExpr)>,
        otherwise: Option<Box<SqlExpr>>,
    },
    Cast {
        expr: Box<SqlExpr>,
        data_type: String,
    },
    Opaque(String),
}

impl SqlExpr {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SqlExpr::Literal(Literal::Number(value)) => Some(*value),
            SqlExpr::UnaryOp { op, expr } if op == "-" => expr.as_number().map(|v| -v),
            _ => None,
        }
    }
}

/// Depth-first visitor over [`SqlExpr`] trees.
///
/// The default methods walk every child; implementors override the hooks they
/// care about and call the matching `walk_*` function to keep descending.
pub trait Visitor {
    fn visit_expr(&mut self, expr: &SqlExpr) {
        walk_expr(self, expr);
    }

    fn visit_function(&mut self, call: &FunctionCall) {
        walk_function(self, call);
    }

    fn visit_subquery(&mut self, _subquery: &SubQuery) {}

    fn visit_column(&mut self, _name: &str) {}
}

pub fn walk_function<V: Visitor + ?Sized>(visitor: &mut V, call: &FunctionCall) {
    for arg in &call.args {
        visitor.visit_expr(arg);
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(visitor: &mut V, expr: &SqlExpr) {
    match expr {
        SqlExpr::Column(name) => visitor.visit_column(name),
        SqlExpr::Literal(_) | SqlExpr::Wildcard | SqlExpr::Opaque(_) => {}
        SqlExpr::FunctionCall(call) => visitor.visit_function(call),
        SqlExpr::BinaryOp { left, right, .. } => {
            visitor.visit_expr(left);
            visitor.visit_expr(right);
        }
        SqlExpr::BoolOp { operands, .. } => {
            for operand in operands {
                visitor.visit_expr(operand);
            }
        }
        SqlExpr::UnaryOp { expr, .. }
        | SqlExpr::IsNull { expr, .. }
        | SqlExpr::Cast { expr, .. } => visitor.visit_expr(expr),
        SqlExpr::SubSelect(subquery) => visitor.visit_subquery(subquery),
        SqlExpr::InList { expr, list, .. } => {
            visitor.visit_expr(expr);
            for item in list {
                visitor.visit_expr(item);
            }
        }
        SqlExpr::Between {
            expr, low, high, ..
        } => {
            visitor.visit_expr(expr);
            visitor.visit_expr(low);
            visitor.visit_expr(high);
        }
        SqlExpr::Case {
            operand,
            branches,
            otherwise,
        } => {
            if let Some(operand) = operand {
                visitor.visit_expr(operand);
            }
            for (condition, result) in branches {
                visitor.visit_expr(condition);
                visitor.visit_expr(result);
            }
            if let Some(otherwise) = otherwise {
                visitor.visit_expr(otherwise);
            }
        }
    }
}

/// Parses exactly one `SELECT` statement and lowers it.
pub fn parse_select(text: &str) -> Result<SelectStatement, SqlError> {
    let statements = Parser::parse_sql(&GenericDialect {}, text)
        .map_err(|err| SqlError::Syntax(err.to_string()))?;
    if statements.len() != 1 {
        return Err(SqlError::StatementCount(statements.len()));
    }
    match &statements[0] {
        sql::Statement::Query(query) => lower_query(query),
        _ => Err(SqlError::NotAQuery),
    }
}

fn lower_query(query: &sql::Query) -> Result<SelectStatement, SqlError> {
    let ctes: Vec<SubQuery> = query
        .with
        .as_ref()
        .map(|with| {
            with.cte_tables
                .iter()
                .map(|cte| SubQuery::from_query(&cte.query))
                .collect()
        })
        .unwrap_or_default();
    match query.body.as_ref() {
        sql::SetExpr::Select(select) => Ok(lower_select(select, ctes)),
        sql::SetExpr::Query(inner) => {
            let mut statement = lower_query(inner)?;
            statement.ctes.extend(ctes);
            Ok(statement)
        }
        sql::SetExpr::SetOperation { .. } => Err(SqlError::SetOperation),
        _ => Err(SqlError::NotAQuery),
    }
}

fn lower_select(select: &sql::Select, ctes: Vec<SubQuery>) -> SelectStatement {
    let projection = select.projection.iter().map(lower_select_item).collect();
    let from = select
        .from
        .iter()
        .flat_map(lower_table_with_joins)
        .collect();
    let (group_by, group_by_all) = match &select.group_by {
        sql::GroupByExpr::All => (Vec::new(), true),
        sql::GroupByExpr::Expressions(exprs) => (exprs.iter().map(lower_expr).collect(), false),
    };
    SelectStatement {
        projection,
        from,
        selection: select.selection.as_ref().map(lower_expr),
        group_by,
        group_by_all,
        having: select.having.as_ref().map(lower_expr),
        ctes,
    }
}

fn lower_select_item(item: &sql::SelectItem) -> SelectItem {
    match item {
        sql::SelectItem::UnnamedExpr(expr) => SelectItem::Expr {
            expr: lower_expr(expr),
            alias: None,
        },
        sql::SelectItem::ExprWithAlias { expr, alias } => SelectItem::Expr {
            expr: lower_expr(expr),
            alias: Some(alias.value.clone()),
        },
        sql::SelectItem::QualifiedWildcard(name, _) => SelectItem::Wildcard {
            qualifier: Some(name.to_string()),
        },
        sql::SelectItem::Wildcard(_) => SelectItem::Wildcard { qualifier: None },
    }
}

fn lower_table_with_joins(table: &sql::TableWithJoins) -> Vec<Relation> {
    std::iter::once(&table.relation)
        .chain(table.joins.iter().map(|join| &join.relation))
        .map(lower_table_factor)
        .collect()
}

fn lower_table_factor(factor: &sql::TableFactor) -> Relation {
    match factor {
        sql::TableFactor::Table { name, .. } => Relation::Table {
            name: name.to_string(),
        },
        sql::TableFactor::Derived { subquery, .. } => {
            Relation::SubSelect(SubQuery::from_query(subquery))
        }
        sql::TableFactor::NestedJoin {
            table_with_joins, ..
        } => Relation::Nested(lower_table_with_joins(table_with_joins)),
        other => Relation::Other(other.to_string()),
    }
}

fn lower_expr(expr: &sql::Expr) -> SqlExpr {
    match expr {
        sql::Expr::Identifier(ident) => SqlExpr::Column(ident.value.clone()),
        sql::Expr::CompoundIdentifier(idents) => SqlExpr::Column(
            idents
                .iter()
                .map(|ident| ident.value.as_str())
                .collect::<Vec<_>>()
                .join("."),
        ),
        sql::Expr::Value(value) => SqlExpr::Literal(lower_value(value)),
        sql::Expr::Function(function) => SqlExpr::FunctionCall(lower_function(function)),
        sql::Expr::BinaryOp { left, op, right } => match op {
            sql::BinaryOperator::And => bool_op(BoolOperator::And, left, right),
            sql::BinaryOperator::Or => bool_op(BoolOperator::Or, left, right),
            _ => SqlExpr::BinaryOp {
                left: Box::new(lower_expr(left)),
                op: lower_binary_operator(op),
                right: Box::new(lower_expr(right)),
            },
        },
        sql::Expr::UnaryOp { op, expr } => SqlExpr::UnaryOp {
            op: op.to_string(),
            expr: Box::new(lower_expr(expr)),
        },
        sql::Expr::Nested(inner) => lower_expr(inner),
        sql::Expr::Subquery(query) => SqlExpr::SubSelect(SubQuery::from_query(query)),
        sql::Expr::Exists { subquery, .. } => SqlExpr::SubSelect(SubQuery::from_query(subquery)),
        sql::Expr::InSubquery {
            expr,
            subquery,
            negated,
        } => SqlExpr::InList {
            expr: Box::new(lower_expr(expr)),
            list: vec![SqlExpr::SubSelect(SubQuery::from_query(subquery))],
            negated: *negated,
        },
        sql::Expr::InList {
            expr,
            list,
            negated,
        } => SqlExpr::InList {
            expr: Box::new(lower_expr(expr)),
            list: list.iter().map(lower_expr).collect(),
            negated: *negated,
        },
        sql::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => SqlExpr::Between {
            expr: Box::new(lower_expr(expr)),
            low: Box::new(lower_expr(low)),
            high: Box::new(lower_expr(high)),
            negated: *negated,
        },
        sql::Expr::IsNull(inner) => SqlExpr::IsNull {
            expr: Box::new(lower_expr(inner)),
            negated: false,
        },
        sql::Expr::IsNotNull(inner) => SqlExpr::IsNull {
            expr: Box::new(lower_expr(inner)),
            negated: true,
        },
        sql::Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => SqlExpr::Case {
            operand: operand.as_ref().map(|operand| Box::new(lower_expr(operand))),
            branches: conditions
                .iter()
                .zip(results.iter())
                .map(|(condition, result)| (lower_expr(condition), lower_expr(result)))
                .collect(),
            otherwise: else_result
                .as_ref()
                .map(|otherwise| Box::new(lower_expr(otherwise))),
        },
        sql::Expr::Cast {
            expr, data_type, ..
        } => SqlExpr::Cast {
            expr: Box::new(lower_expr(expr)),
            data_type: data_type.to_string(),
        },
        other => SqlExpr::Opaque(other.to_string()),
    }
}

fn bool_op(op: BoolOperator, left: &sql::Expr, right: &sql::Expr) -> SqlExpr {
    let mut operands = Vec::new();
    for side in [lower_expr(left), lower_expr(right)] {
        match side {
            SqlExpr::BoolOp {
                op: inner,
                operands: nested,
            } if inner == op => operands.extend(nested),
            other => operands.push(other),
        }
    }
    SqlExpr::BoolOp { op, operands }
}

fn lower_function(function: &sql::Function) -> FunctionCall {
    let name = function
        .name
        .0
        .last()
        .map(|ident| ident.value.to_ascii_uppercase())
        .unwrap_or_default();
    let args = function
        .args
        .iter()
        .map(|arg| match arg {
            sql::FunctionArg::Named { arg, .. } | sql::FunctionArg::Unnamed(arg) => {
                lower_function_arg(arg)
            }
        })
        .collect();
    FunctionCall {
        name,
        args,
        windowed: function.over.is_some(),
    }
}

fn lower_function_arg(arg: &sql::FunctionArgExpr) -> SqlExpr {
    match arg {
        sql::FunctionArgExpr::Expr(expr) => lower_expr(expr),
        sql::FunctionArgExpr::Wildcard | sql::FunctionArgExpr::QualifiedWildcard(_) => {
            SqlExpr::Wildcard
        }
    }
}

fn lower_value(value: &sql::Value) -> Literal {
    match value {
        sql::Value::Number(text, _) => text
            .parse::<f64>()
            .map(Literal::Number)
            .unwrap_or_else(|_| Literal::Other(text.clone())),
        sql::Value::SingleQuotedString(text) | sql::Value::DoubleQuotedString(text) => {
            Literal::String(text.clone())
        }
        sql::Value::Boolean(value) => Literal::Boolean(*value),
        sql::Value::Null => Literal::Null,
        other => Literal::Other(other.to_string()),
    }
}

fn lower_binary_operator(op: &sql::BinaryOperator) -> BinaryOperator {
    match op {
        sql::BinaryOperator::Eq => BinaryOperator::Eq,
        sql::BinaryOperator::NotEq => BinaryOperator::NotEq,
        sql::BinaryOperator::Lt => BinaryOperator::Lt,
        sql::BinaryOperator::LtEq => BinaryOperator::LtEq,
        sql::BinaryOperator::Gt => BinaryOperator::Gt,
        sql::BinaryOperator::GtEq => BinaryOperator::GtEq,
        sql::BinaryOperator::Plus => BinaryOperator::Plus,
        sql::BinaryOperator::Minus => BinaryOperator::Minus,
        sql::BinaryOperator::Multiply => BinaryOperator::Multiply,
        sql::BinaryOperator::Divide => BinaryOperator::Divide,
        sql::BinaryOperator::Modulo => BinaryOperator::Modulo,
        other => BinaryOperator::Other(other.to_string()),
    }
}
