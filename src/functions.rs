//! Names and kinds of the server functions.

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Query,
    Mutation,
}

/// A reference to a server function by kind and `module:name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    pub kind: FunctionKind,
    pub name: &'static str,
}

impl FunctionRef {
    pub const fn query(name: &'static str) -> Self {
        Self {
            kind: FunctionKind::Query,
            name,
        }
    }

    pub const fn mutation(name: &'static str) -> Self {
        Self {
            kind: FunctionKind::Mutation,
            name,
        }
    }

    pub fn is_query(&self) -> bool {
        self.kind == FunctionKind::Query
    }
}

impl Display for FunctionRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FunctionKind::Query => "query",
            FunctionKind::Mutation => "mutation",
        };
        write!(f, "{kind} {}", self.name)
    }
}

pub mod api {
    pub mod messages {
        use crate::functions::FunctionRef;

        pub const LIST: FunctionRef = FunctionRef::query("messages:list");
        pub const CREATE: FunctionRef = FunctionRef::mutation("messages:create");
        pub const UPDATE: FunctionRef = FunctionRef::mutation("messages:update");
        pub const REMOVE: FunctionRef = FunctionRef::mutation("messages:remove");

        pub const ALL: [FunctionRef; 4] = [LIST, CREATE, UPDATE, REMOVE];
    }

    /// Looks a function up by its `module:name`.
    pub fn lookup(name: &str) -> Option<crate::functions::FunctionRef> {
        messages::ALL.into_iter().find(|f| f.name == name)
    }
}
