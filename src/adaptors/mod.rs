pub mod evm_reference;
