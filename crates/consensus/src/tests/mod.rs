mod network_test;
mod protocol_test;
