//! Static table-reference extraction.
//!
//! Given raw SQL text, parse it and walk the AST to find every table name the
//! query reads from: direct `FROM`/`JOIN` sources, sub-queries nested inside
//! `FROM`, and sub-queries sitting in projections, predicates, CTE bodies or
//! set operations. The orchestrator stages exactly these tables before
//! execution, so a missed reference means a broken query downstream.
//!
//! Names are normalized the same way throughout the crate: double quotes
//! stripped, lowercased. CTE aliases are subtracted from each statement's set
//! since they shadow real tables and must not be fetched from the foreign
//! connection. Multi-part names (`db.t`) refer to a foreign namespace that
//! cannot be mirrored here and are skipped, as are quoted names carrying an
//! embedded dot (`"my.table"`).

use std::collections::{BTreeSet, HashSet};

use sqlparser::ast::{
    Delete, Expr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr,
    JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins, UpdateTableFromKind,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::debug;

/// One de-duplicated set of referenced table names per recognized top-level
/// statement.
///
/// Never errors: unparseable input yields an empty sequence, a statement with
/// no `FROM` clause yields an empty set, and statements of kinds that read no
/// tables (`SET`, transaction control and the like) are dropped from the
/// sequence.
pub fn extract_tables(sql: &str) -> Vec<BTreeSet<String>> {
    let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements,
        Err(err) => {
            debug!(%err, "skipping unparseable sql");
            return Vec::new();
        }
    };
    statements.iter().filter_map(statement_tables).collect()
}

/// Statement-order flattening of [`extract_tables`] with global
/// de-duplication; this is the staging list the orchestrator works through.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for set in extract_tables(sql) {
        for name in set {
            if seen.insert(name.clone()) {
                out.push(name);
            }
        }
    }
    out
}

pub(crate) fn statement_tables(statement: &Statement) -> Option<BTreeSet<String>> {
    if !matches!(
        statement,
        Statement::Query(_)
            | Statement::Insert(_)
            | Statement::Update { .. }
            | Statement::Delete(_)
            | Statement::CreateTable(_)
            | Statement::CreateView { .. }
    ) {
        return None;
    }
    let mut walker = Walker::default();
    walker.statement(statement);
    let Walker { mut tables, ctes } = walker;
    for cte in &ctes {
        tables.remove(cte);
    }
    Some(tables)
}

/// Strip double quotes and lowercase, mirroring how staged tables are named.
pub(crate) fn normalize_name(name: &ObjectName) -> String {
    name.to_string().replace('"', "").to_lowercase()
}

#[derive(Default)]
struct Walker {
    tables: BTreeSet<String>,
    ctes: HashSet<String>,
}

impl Walker {
    fn statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Query(query) => self.query(query),
            // The INSERT target itself is not a read source; only the source
            // query's tables need staging.
            Statement::Insert(insert) => {
                if let Some(source) = &insert.source {
                    self.query(source);
                }
            }
            Statement::Update {
                assignments,
                from,
                selection,
                ..
            } => {
                if let Some(
                    UpdateTableFromKind::BeforeSet(tables) | UpdateTableFromKind::AfterSet(tables),
                ) = from
                {
                    for twj in tables {
                        self.table_with_joins(twj);
                    }
                }
                for assignment in assignments {
                    self.expr(&assignment.value);
                }
                if let Some(selection) = selection {
                    self.expr(selection);
                }
            }
            Statement::Delete(Delete {
                from,
                using,
                selection,
                ..
            }) => {
                let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) = from;
                for twj in tables {
                    self.table_with_joins(twj);
                }
                if let Some(using) = using {
                    for twj in using {
                        self.table_with_joins(twj);
                    }
                }
                if let Some(selection) = selection {
                    self.expr(selection);
                }
            }
            Statement::CreateTable(create) => {
                if let Some(query) = &create.query {
                    self.query(query);
                }
            }
            Statement::CreateView { query, .. } => self.query(query),
            _ => {}
        }
    }

    fn query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
                self.query(&cte.query);
            }
        }
        self.set_expr(&query.body);
    }

    fn set_expr(&mut self, set_expr: &SetExpr) {
        match set_expr {
            SetExpr::Select(select) => self.select(select),
            SetExpr::Query(query) => self.query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left);
                self.set_expr(right);
            }
            _ => {}
        }
    }

    fn select(&mut self, select: &Select) {
        for twj in &select.from {
            self.table_with_joins(twj);
        }
        for item in &select.projection {
            if let SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } = item {
                self.expr(expr);
            }
        }
        if let Some(selection) = &select.selection {
            self.expr(selection);
        }
        if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
            for expr in exprs {
                self.expr(expr);
            }
        }
        if let Some(having) = &select.having {
            self.expr(having);
        }
    }

    fn table_with_joins(&mut self, twj: &TableWithJoins) {
        self.table_factor(&twj.relation);
        for join in &twj.joins {
            self.table_factor(&join.relation);
            // Sub-queries can hide inside ON constraints as well.
            if let JoinOperator::Join(constraint)
            | JoinOperator::Inner(constraint)
            | JoinOperator::LeftOuter(constraint)
            | JoinOperator::RightOuter(constraint)
            | JoinOperator::FullOuter(constraint) = &join.join_operator
            {
                if let JoinConstraint::On(expr) = constraint {
                    self.expr(expr);
                }
            }
        }
    }

    fn table_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, .. } => {
                if name.0.len() == 1 {
                    let bare = normalize_name(name);
                    // a quoted name with an embedded dot cannot be staged or
                    // fetched under its bare form
                    if !bare.contains('.') {
                        self.tables.insert(bare);
                    }
                }
            }
            TableFactor::Derived { subquery, .. } => self.query(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.table_with_joins(table_with_joins),
            _ => {}
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Subquery(query) => self.query(query),
            Expr::Exists { subquery, .. } => self.query(subquery),
            Expr::InSubquery { expr, subquery, .. } => {
                self.expr(expr);
                self.set_expr(subquery);
            }
            Expr::BinaryOp { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            Expr::UnaryOp { expr, .. } => self.expr(expr),
            Expr::Nested(inner) => self.expr(inner),
            Expr::IsNull(inner) | Expr::IsNotNull(inner) => self.expr(inner),
            Expr::InList { expr, list, .. } => {
                self.expr(expr);
                for item in list {
                    self.expr(item);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.expr(expr);
                self.expr(low);
                self.expr(high);
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                self.expr(expr);
                self.expr(pattern);
            }
            Expr::Cast { expr, .. } => self.expr(expr),
            Expr::AnyOp { left, right, .. } | Expr::AllOp { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            Expr::Case {
                operand,
                conditions,
                else_result,
                ..
            } => {
                if let Some(operand) = operand {
                    self.expr(operand);
                }
                for when in conditions {
                    self.expr(&when.condition);
                    self.expr(&when.result);
                }
                if let Some(else_result) = else_result {
                    self.expr(else_result);
                }
            }
            Expr::Function(function) => {
                if let FunctionArguments::List(list) = &function.args {
                    for arg in &list.args {
                        if let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))
                        | FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(expr),
                            ..
                        } = arg
                        {
                            self.expr(expr);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}
