//! CompiledQuery -> SQL text.
//!
//! Queries without joins are a single SELECT. A query with joins is built in
//! four tiers so that parent rows keep their ordering and limit while every
//! child relation is aggregated into a JSON array (or object for to-one
//! routes):
//!
//! 1. parent rows with a stable `__row_id` from the requested ordering
//! 2. parent x child rows, `__jN_dup` marks the first copy of each child row
//!    within a parent (several joins multiply each other)
//! 3. `__jN_rank` orders the de-duplicated child rows per parent
//! 4. `json_agg` per join, filtered on dup/rank, grouped by `__row_id`
//!
//! Nested join nodes apply the same scheme recursively; a nested node emits
//! its first-hop key columns (`__jkN`) and a `__sort` column for its parent.

use crate::filter::and_all;
use crate::sql::quote_ident;

use super::compiled::CompiledQuery;

const ROW_ID: &str = "\"__row_id\"";
const SORT: &str = "\"__sort\"";

fn join_alias(index: usize) -> String {
    format!("\"__j{index}\"")
}

fn join_col(index: usize, suffix: &str) -> String {
    format!("\"__j{index}_{suffix}\"")
}

fn key_alias(index: usize) -> String {
    format!("\"__jk{index}\"")
}

/// Rows as `{alias: value}` objects, one JSON value per row in column `row`
pub fn fetch_sql(query: &CompiledQuery) -> String {
    format!(
        "SELECT row_to_json(\"__q\") AS \"row\" FROM ({}) \"__q\"",
        select_sql(query)
    )
}

/// The plain statement, one output column per selected alias
pub fn select_sql(query: &CompiledQuery) -> String {
    node_sql(query)
}

/// Number of rows the query matches, ignoring limit and offset
pub fn count_sql(query: &CompiledQuery) -> String {
    if query.is_grouped() {
        let mut unpaged = query.clone();
        unpaged.limit = None;
        unpaged.offset = None;
        unpaged.order_by.clear();
        return format!(
            "SELECT count(*) AS \"count\" FROM ({}) \"__q\"",
            select_sql(&unpaged)
        );
    }
    let children: Vec<String> = query.joins.iter().map(child_sql).collect();
    let mut sql = format!("SELECT count(*) AS \"count\" FROM {}", query.from_sql);
    if let Some(filter) = node_where(query, &children) {
        sql.push_str(&format!(" WHERE {filter}"));
    }
    sql
}

fn node_sql(query: &CompiledQuery) -> String {
    if query.joins.is_empty() {
        leaf_sql(query)
    } else {
        join_node_sql(query)
    }
}

/// ORDER BY list; grouped non-aggregate items use their GROUP BY form
fn order_sql(query: &CompiledQuery, qualifier: &str) -> Option<String> {
    if query.order_by.is_empty() {
        return None;
    }
    let grouped = query.is_grouped();
    let terms: Vec<String> = query
        .order_by
        .iter()
        .map(|clause| {
            let grouped_item = query.items.iter().find(|item| {
                grouped && item.selected && !item.is_aggregate() && item.alias == clause.term.key
            });
            match grouped_item {
                Some(item) => clause.term.render(&item.grouped_sql(qualifier)),
                None => clause.render(qualifier),
            }
        })
        .collect();
    Some(terms.join(", "))
}

fn window(order: Option<&str>) -> String {
    match order {
        Some(order) => format!("row_number() OVER (ORDER BY {order})"),
        None => "row_number() OVER ()".to_string(),
    }
}

fn push_paging(sql: &mut String, query: &CompiledQuery, order: Option<&str>) {
    if let Some(order) = order {
        sql.push_str(&format!(" ORDER BY {order}"));
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = query.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
}

fn leaf_sql(query: &CompiledQuery) -> String {
    let qualifier = query.qualifier();
    let grouped = query.is_grouped();
    let order = order_sql(query, &qualifier);

    let mut columns = Vec::new();
    let mut group_by = Vec::new();
    for item in query.output_items() {
        let expr = if grouped && !item.is_aggregate() {
            group_by.push((columns.len() + 1).to_string());
            item.grouped_sql(&qualifier)
        } else {
            item.sql(&qualifier)
        };
        columns.push(format!("{expr} AS {}", quote_ident(&item.alias)));
    }
    if let Some(info) = &query.join {
        for (index, (_, child_expr)) in info.keys.iter().enumerate() {
            columns.push(format!("{child_expr} AS {}", key_alias(index)));
            if grouped {
                group_by.push(columns.len().to_string());
            }
        }
        columns.push(format!("{} AS {SORT}", window(order.as_deref())));
    }

    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), query.from_sql);
    if let Some(filter) = &query.where_clause {
        sql.push_str(&format!(" WHERE {filter}"));
    }
    if !group_by.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", group_by.join(", ")));
    }
    if query.join.is_none() {
        push_paging(&mut sql, query, order.as_deref());
    }
    sql
}

/// Parent filter plus an EXISTS test per inner join
fn node_where(query: &CompiledQuery, children: &[String]) -> Option<String> {
    let qualifier = query.qualifier();
    let inner_joins = query
        .joins
        .iter()
        .zip(children)
        .filter_map(|(child, child_sql)| {
            let info = child.join.as_ref()?;
            if info.left_join {
                return None;
            }
            let matches: Vec<String> = info
                .keys
                .iter()
                .enumerate()
                .map(|(index, (parent_col, _))| {
                    format!(
                        "\"__e\".{} = {qualifier}.{}",
                        key_alias(index),
                        quote_ident(parent_col)
                    )
                })
                .collect();
            Some(Some(format!(
                "EXISTS (SELECT 1 FROM ({child_sql}) \"__e\" WHERE {})",
                matches.join(" AND ")
            )))
        });
    and_all(std::iter::once(query.where_clause.clone()).chain(inner_joins))
}

fn join_node_sql(query: &CompiledQuery) -> String {
    let q = query.qualifier();
    let nested = query.join.as_ref();
    let children: Vec<String> = query.joins.iter().map(child_sql).collect();
    let order = order_sql(query, &q);

    // Tier 1: parent rows
    let mut columns = vec![format!("{q}.*")];
    if let Some(info) = nested {
        for (index, (_, child_expr)) in info.keys.iter().enumerate() {
            columns.push(format!("{child_expr} AS {}", key_alias(index)));
        }
    }
    columns.push(format!("{} AS {ROW_ID}", window(order.as_deref())));
    let mut tier1 = format!("SELECT {} FROM {}", columns.join(", "), query.from_sql);
    if let Some(filter) = node_where(query, &children) {
        tier1.push_str(&format!(" WHERE {filter}"));
    }
    if nested.is_none() {
        push_paging(&mut tier1, query, order.as_deref());
    }

    // Tier 2: attach every child
    let mut columns = vec![format!("{q}.*")];
    let mut from = format!("({tier1}) {q}");
    for (index, (child, child_sql)) in query.joins.iter().zip(&children).enumerate() {
        let alias = join_alias(index);
        columns.push(format!("{alias}.\"__json\" AS {}", join_col(index, "json")));
        columns.push(format!("{alias}.{SORT} AS {}", join_col(index, "sort")));
        columns.push(format!(
            "row_number() OVER (PARTITION BY {q}.{ROW_ID}, {alias}.{SORT}) AS {}",
            join_col(index, "dup")
        ));
        let (kind, on) = match &child.join {
            Some(info) => {
                let on: Vec<String> = info
                    .keys
                    .iter()
                    .enumerate()
                    .map(|(k, (parent_col, _))| {
                        format!("{q}.{} = {alias}.{}", quote_ident(parent_col), key_alias(k))
                    })
                    .collect();
                let kind = if info.left_join { "LEFT JOIN" } else { "INNER JOIN" };
                (kind, on.join(" AND "))
            }
            None => ("LEFT JOIN", "FALSE".to_string()),
        };
        from.push_str(&format!(" {kind} ({child_sql}) {alias} ON {on}"));
    }
    let tier2 = format!("SELECT {} FROM {from}", columns.join(", "));

    // Tier 3: rank child rows per parent
    let mut columns = vec![format!("{q}.*")];
    for index in 0..query.joins.len() {
        columns.push(format!(
            "row_number() OVER (PARTITION BY {q}.{ROW_ID}, {q}.{} ORDER BY {q}.{}) AS {}",
            join_col(index, "dup"),
            join_col(index, "sort"),
            join_col(index, "rank")
        ));
    }
    let tier3 = format!("SELECT {} FROM ({tier2}) {q}", columns.join(", "));

    // Tier 4: aggregate
    let mut columns = Vec::new();
    let mut group_by = vec![format!("{q}.{ROW_ID}")];
    for item in query.output_items() {
        let child = query
            .joins
            .iter()
            .position(|j| j.alias == item.alias)
            .map(|index| (index, &query.joins[index]));
        let expr = match child {
            Some((index, child)) => aggregate_child(&q, index, child),
            None => {
                group_by.push((columns.len() + 1).to_string());
                item.grouped_sql(&q)
            }
        };
        columns.push(format!("{expr} AS {}", quote_ident(&item.alias)));
    }
    if let Some(info) = nested {
        for index in 0..info.keys.len() {
            columns.push(format!("{q}.{0} AS {0}", key_alias(index)));
            group_by.push(columns.len().to_string());
        }
        columns.push(format!("{q}.{ROW_ID} AS {SORT}"));
    }

    let mut sql = format!(
        "SELECT {} FROM ({tier3}) {q} GROUP BY {}",
        columns.join(", "),
        group_by.join(", ")
    );
    if nested.is_none() {
        sql.push_str(&format!(" ORDER BY {q}.{ROW_ID}"));
    }
    sql
}

fn aggregate_child(q: &str, index: usize, child: &CompiledQuery) -> String {
    let json = join_col(index, "json");
    let mut keep = Vec::new();
    if let Some(limit) = child.limit {
        keep.push(format!("{q}.{} <= {limit}", join_col(index, "rank")));
    }
    keep.push(format!("{q}.{} = 1", join_col(index, "dup")));
    keep.push(format!("{q}.{json} IS NOT NULL"));
    let agg = format!(
        "json_agg({q}.{json} ORDER BY {q}.{}) FILTER (WHERE {})",
        join_col(index, "sort"),
        keep.join(" AND ")
    );
    let to_one = child.join.as_ref().is_some_and(|info| info.to_one);
    if to_one {
        format!("({agg})->0")
    } else {
        format!("COALESCE({agg}, '[]'::json)")
    }
}

/// Child node with its selected columns folded into `__json`
fn child_sql(child: &CompiledQuery) -> String {
    let inner = node_sql(child);
    let columns: Vec<String> = child
        .output_items()
        .map(|item| format!("\"__c\".{0} AS {0}", quote_ident(&item.alias)))
        .collect();
    let keys: String = child
        .join
        .as_ref()
        .map(|info| {
            (0..info.keys.len())
                .map(|k| format!(", \"__c\".{0} AS {0}", key_alias(k)))
                .collect()
        })
        .unwrap_or_default();
    format!(
        "SELECT (SELECT row_to_json(\"__r\") FROM (SELECT {}) \"__r\") AS \"__json\", \"__c\".{SORT} AS {SORT}{keys} FROM ({inner}) \"__c\"",
        columns.join(", ")
    )
}
