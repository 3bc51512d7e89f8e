pub use loadpub_common::testing::init_test_logging;
