pub mod order_repository;
pub mod product_repository;

pub use order_repository::{
    AddressSnapshot, CustomerSnapshot, NewOrder, OrderRepository, OrderTransition, OrderWithItems,
    StatusUpdate,
};
pub use product_repository::{NewProduct, ProductRepository};
