use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;

use crate::crawler::DhtCrawler;
use crate::network::PeerNetwork;

pub type GenericBoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

pub type SharedNetwork = Arc<dyn PeerNetwork>;

pub type SharedCrawler = Arc<dyn DhtCrawler>;
