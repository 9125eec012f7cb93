use std::sync::Arc;

use juniper::{GraphQLType, RootNode, ScalarValue, SchemaType};

/// Schema defines the requirements for schemas that operations can be validated against.
/// Typically this is just an `Arc<RootNode<...>>` and you should not have to implement it
/// yourself.
///
/// This transport never executes operations, so only the type information of the schema is
/// required, not its resolvers.
pub trait Schema: Clone + Send + Sync + 'static {
    /// The scalar value type.
    type ScalarValue: ScalarValue + Send + Sync;

    /// Returns the type information used to parse and validate operations.
    fn schema_type(&self) -> &SchemaType<'static, Self::ScalarValue>;
}

impl<QueryT, MutationT, SubscriptionT, S> Schema
    for Arc<RootNode<'static, QueryT, MutationT, SubscriptionT, S>>
where
    QueryT: GraphQLType<S> + Send + Sync + 'static,
    QueryT::TypeInfo: Send + Sync,
    MutationT: GraphQLType<S, Context = QueryT::Context> + Send + Sync + 'static,
    MutationT::TypeInfo: Send + Sync,
    SubscriptionT: GraphQLType<S, Context = QueryT::Context> + Send + Sync + 'static,
    SubscriptionT::TypeInfo: Send + Sync,
    S: ScalarValue + Send + Sync + 'static,
{
    type ScalarValue = S;

    fn schema_type(&self) -> &SchemaType<'static, S> {
        &self.schema
    }
}
