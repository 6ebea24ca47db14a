//! Namespace qualification of staged table references.
//!
//! The original query names tables the way the foreign connection knows them;
//! inside the engine they live in the per-call isolated namespace. Rewriting
//! is tree-aware: the statement is parsed and only identifier-position table
//! references whose bare name was staged are rewritten to
//! `<namespace>.<name>`, then each statement is rendered back to SQL text.
//! A table name that also appears as a column, inside a string literal or as
//! a substring of another identifier is left untouched, and a CTE alias
//! shadows a staged table of the same name within its statement.

use std::collections::HashSet;

use sqlparser::ast::{
    Delete, Expr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Ident,
    JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, TableObject, TableWithJoins, UpdateTableFromKind,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::error::Result;
use crate::extract::normalize_name;

/// Rewrite every staged-table reference in `sql` to its namespace-qualified
/// form, returning one rendered SQL string per top-level statement.
pub fn qualify_tables(sql: &str, namespace: &str, tables: &[String]) -> Result<Vec<String>> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)?;
    let staged: HashSet<&str> = tables.iter().map(String::as_str).collect();
    let mut rewriter = Rewriter {
        namespace,
        staged,
        ctes: HashSet::new(),
    };
    for statement in &mut statements {
        rewriter.statement(statement);
    }
    let rendered: Vec<String> = statements.iter().map(Statement::to_string).collect();
    debug!(namespace, statements = rendered.len(), "rewrote query for isolated namespace");
    Ok(rendered)
}

struct Rewriter<'a> {
    namespace: &'a str,
    staged: HashSet<&'a str>,
    // CTE aliases of the statement being rewritten; they shadow staged tables
    // and must stay unqualified.
    ctes: HashSet<String>,
}

impl Rewriter<'_> {
    fn qualify(&self, name: &mut ObjectName) {
        if name.0.len() != 1 {
            return;
        }
        let bare = normalize_name(name);
        if bare.contains('.') || self.ctes.contains(&bare) {
            return;
        }
        if self.staged.contains(bare.as_str()) {
            *name = ObjectName::from(vec![Ident::new(self.namespace), Ident::new(bare)]);
        }
    }

    fn statement(&mut self, statement: &mut Statement) {
        self.ctes.clear();
        match statement {
            Statement::Query(query) => self.query(query),
            Statement::Insert(insert) => {
                // A staged table can be the write target too.
                if let TableObject::TableName(name) = &mut insert.table {
                    self.qualify(name);
                }
                if let Some(source) = &mut insert.source {
                    self.query(source);
                }
            }
            Statement::Update {
                table,
                assignments,
                from,
                selection,
                ..
            } => {
                self.table_with_joins(table);
                if let Some(
                    UpdateTableFromKind::BeforeSet(tables) | UpdateTableFromKind::AfterSet(tables),
                ) = from
                {
                    for twj in tables {
                        self.table_with_joins(twj);
                    }
                }
                for assignment in assignments {
                    self.expr(&mut assignment.value);
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
                if let Some(query) = &mut create.query {
                    self.query(query);
                }
            }
            Statement::CreateView { query, .. } => self.query(query),
            _ => {}
        }
    }

    fn query(&mut self, query: &mut Query) {
        if let Some(with) = &mut query.with {
            for cte in &mut with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
                self.query(&mut cte.query);
            }
        }
        self.set_expr(&mut query.body);
    }

    fn set_expr(&mut self, set_expr: &mut SetExpr) {
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

    fn select(&mut self, select: &mut Select) {
        for twj in &mut select.from {
            self.table_with_joins(twj);
        }
        for item in &mut select.projection {
            if let SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } = item {
                self.expr(expr);
            }
        }
        if let Some(selection) = &mut select.selection {
            self.expr(selection);
        }
        if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
            for expr in exprs {
                self.expr(expr);
            }
        }
        if let Some(having) = &mut select.having {
            self.expr(having);
        }
    }

    fn table_with_joins(&mut self, twj: &mut TableWithJoins) {
        self.table_factor(&mut twj.relation);
        for join in &mut twj.joins {
            self.table_factor(&mut join.relation);
            if let JoinOperator::Join(constraint)
            | JoinOperator::Inner(constraint)
            | JoinOperator::LeftOuter(constraint)
            | JoinOperator::RightOuter(constraint)
            | JoinOperator::FullOuter(constraint) = &mut join.join_operator
            {
                if let JoinConstraint::On(expr) = constraint {
                    self.expr(expr);
                }
            }
        }
    }

    fn table_factor(&mut self, factor: &mut TableFactor) {
        match factor {
            TableFactor::Table { name, .. } => self.qualify(name),
            TableFactor::Derived { subquery, .. } => self.query(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.table_with_joins(table_with_joins),
            _ => {}
        }
    }

    fn expr(&mut self, expr: &mut Expr) {
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
                    self.expr(&mut when.condition);
                    self.expr(&mut when.result);
                }
                if let Some(else_result) = else_result {
                    self.expr(else_result);
                }
            }
            Expr::Function(function) => {
                if let FunctionArguments::List(list) = &mut function.args {
                    for arg in &mut list.args {
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
