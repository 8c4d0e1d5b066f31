//! Authentication and authorization.

pub mod authz;
pub mod token;

pub use authz::{Authorizer, ResourceContext};
pub use token::{Claims, Permission, Principal, Role, TokenService};
