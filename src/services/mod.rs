// Stock and catalog
pub mod catalog;
pub mod inventory_ledger;

// Cart and checkout
pub mod addresses;
pub mod carts;
pub mod checkout;
pub mod orders;

// Payments
pub mod gateway;
pub mod payments;
