pub mod aggregator;
pub mod definition;

pub use aggregator::EventAggregator;
pub use definition::AggregationDefinition;
