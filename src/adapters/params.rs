//! Binding [`QueryParam`] slices onto sqlx queries.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{MySql, Postgres};

macro_rules! param_binder {
    ($name:ident, $db:ty, $args:ty) => {
        /// Bind every parameter, in order, onto `query`.
        pub(crate) fn $name<'q>(
            params: &'q [QueryParam],
            mut query: Query<'q, $db, $args>,
        ) -> Query<'q, $db, $args> {
            for param in params {
                query = match param {
                    QueryParam::Null => query.bind(None::<String>),
                    QueryParam::Bool(v) => query.bind(*v),
                    QueryParam::Int(v) => query.bind(*v),
                    QueryParam::Float(v) => query.bind(*v),
                    QueryParam::String(v) => query.bind(v.as_str()),
                    QueryParam::Bytes(v) => query.bind(v.as_slice()),
                    QueryParam::Json(v) => query.bind(Json(v)),
                };
            }
            query
        }
    };
}

param_binder!(bind_mysql_params, MySql, MySqlArguments);
param_binder!(bind_postgres_params, Postgres, PgArguments);
