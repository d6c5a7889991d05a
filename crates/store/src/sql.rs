//! SQL text for filtered reads, shared by the SQLite and Postgres executors.

use soilrepo_contracts::{FilterDescriptor, SchemaDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    Float(f64),
}

/// Restricts rows to sample ids selected by a filter on the samples table.
#[derive(Debug, Clone, Copy)]
pub struct SampleScope<'a> {
    pub schema: &'a SchemaDescriptor,
    pub filter: &'a FilterDescriptor,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// WHERE clauses plus their bind values, in placeholder order.
#[derive(Debug, Clone)]
pub struct Predicate {
    dialect: Dialect,
    clauses: Vec<String>,
    binds: Vec<BindValue>,
}

impl Predicate {
    pub fn for_filter(
        dialect: Dialect,
        schema: &SchemaDescriptor,
        filter: &FilterDescriptor,
        scope: Option<SampleScope<'_>>,
    ) -> Self {
        let mut predicate = Self {
            dialect,
            clauses: Vec::new(),
            binds: Vec::new(),
        };

        let own = predicate.filter_clauses(schema, filter);
        predicate.clauses.extend(own);

        if let Some(scope) = scope
            && let (Some(outer), Some(inner)) = (
                schema.sample_id_column.as_deref(),
                scope.schema.sample_id_column.as_deref(),
            )
        {
            let inner_clauses = predicate.filter_clauses(scope.schema, scope.filter);
            let mut subquery = format!(
                "SELECT {} FROM {}",
                predicate.as_text(&quote_ident(inner)),
                quote_ident(&scope.schema.table_name)
            );
            if !inner_clauses.is_empty() {
                subquery.push_str(" WHERE ");
                subquery.push_str(&inner_clauses.join(" AND "));
            }
            let clause = format!("{} IN ({})", predicate.as_text(&quote_ident(outer)), subquery);
            predicate.clauses.push(clause);
        }

        predicate
    }

    pub fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn binds(&self) -> &[BindValue] {
        &self.binds
    }

    fn filter_clauses(&mut self, schema: &SchemaDescriptor, filter: &FilterDescriptor) -> Vec<String> {
        let mut clauses = Vec::new();

        if let Some(time) = schema.time_column.as_deref() {
            let column = quote_ident(time);
            if let Some(from) = filter.time_from.as_ref() {
                let p = self.bind(BindValue::Text(from.clone()));
                clauses.push(format!("{} >= {}", self.as_time(&column), self.as_time(&p)));
            }
            if let Some(to) = filter.time_to.as_ref() {
                let p = self.bind(BindValue::Text(to.clone()));
                clauses.push(format!("{} <= {}", self.as_time(&column), self.as_time(&p)));
            }
        }

        if let Some((lon_col, lat_col)) = schema.geo_columns() {
            let lon = self.as_number(&quote_ident(lon_col));
            let lat = self.as_number(&quote_ident(lat_col));
            let boxes = [filter.bbox, filter.within].into_iter().flatten().collect::<Vec<_>>();
            if !boxes.is_empty()
                && let Some(guard) = self.numeric_guard(&[lon_col, lat_col])
            {
                clauses.push(guard);
            }
            for bbox in boxes {
                let west = self.bind(BindValue::Float(bbox.west));
                let east = self.bind(BindValue::Float(bbox.east));
                let south = self.bind(BindValue::Float(bbox.south));
                let north = self.bind(BindValue::Float(bbox.north));
                clauses.push(format!(
                    "({lon} BETWEEN {west} AND {east} AND {lat} BETWEEN {south} AND {north})"
                ));
            }
        }

        if let (Some(column), Some(country)) =
            (schema.country_column.as_deref(), filter.country.as_ref())
        {
            let p = self.bind(BindValue::Text(country.clone()));
            clauses.push(format!(
                "UPPER({}) = {}",
                self.as_text(&quote_ident(column)),
                p
            ));
        }

        if let (Some(column), Some(sample_id)) =
            (schema.sample_id_column.as_deref(), filter.sample_id.as_ref())
        {
            let p = self.bind(BindValue::Text(sample_id.clone()));
            clauses.push(format!("{} = {}", self.as_text(&quote_ident(column)), p));
        }

        if let Some(code) = filter.parameter_code.as_ref()
            && schema.has_column("parameter_code")
        {
            let p = self.bind(BindValue::Text(code.clone()));
            clauses.push(format!(
                "{} = {}",
                self.as_text(&quote_ident("parameter_code")),
                p
            ));
        }

        clauses
    }

    fn bind(&mut self, value: BindValue) -> String {
        self.binds.push(value);
        match self.dialect {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", self.binds.len()),
        }
    }

    fn as_text(&self, expr: &str) -> String {
        format!("CAST({} AS TEXT)", expr)
    }

    fn as_number(&self, expr: &str) -> String {
        match self.dialect {
            Dialect::Sqlite => format!("CAST({} AS REAL)", expr),
            Dialect::Postgres => format!("CAST({} AS DOUBLE PRECISION)", expr),
        }
    }

    /// SQLite casts empty or non-numeric text to 0.0, so a bbox around (0,0) would match
    /// rows without coordinates. Only numbers and numeric-looking text pass.
    fn numeric_guard(&self, columns: &[&str]) -> Option<String> {
        match self.dialect {
            Dialect::Sqlite => Some(
                columns
                    .iter()
                    .map(|c| {
                        let c = quote_ident(c);
                        format!(
                            "(typeof({c}) IN ('integer', 'real') OR (typeof({c}) = 'text' \
                             AND trim({c}) <> '' AND trim({c}) NOT GLOB '*[^0-9.eE+-]*'))"
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" AND "),
            ),
            Dialect::Postgres => None,
        }
    }

    /// SQLite compares ISO text lexicographically; Postgres compares instants.
    fn as_time(&self, expr: &str) -> String {
        match self.dialect {
            Dialect::Sqlite => expr.to_string(),
            Dialect::Postgres => format!("CAST({} AS TIMESTAMPTZ)", expr),
        }
    }
}

pub fn select_sql(
    schema: &SchemaDescriptor,
    select_list: &[String],
    predicate: &Predicate,
    filter: &FilterDescriptor,
    page: bool,
) -> String {
    let mut sql = format!(
        "SELECT {} FROM {}{}",
        select_list.join(", "),
        quote_ident(&schema.table_name),
        predicate.where_sql()
    );

    if !filter.order_by.is_empty() && schema.has_column(&filter.order_by) {
        sql.push_str(&format!(
            " ORDER BY {} {}",
            quote_ident(&filter.order_by),
            filter.direction.as_sql()
        ));
    }

    if page {
        sql.push_str(&format!(" LIMIT {} OFFSET {}", filter.limit, filter.offset));
    }
    sql
}

pub fn count_sql(schema: &SchemaDescriptor, predicate: &Predicate) -> String {
    format!(
        "SELECT COUNT(*) FROM {}{}",
        quote_ident(&schema.table_name),
        predicate.where_sql()
    )
}
