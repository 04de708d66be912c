use std::env;
use std::sync::Once;

use flexi_logger::Logger;

static INIT: Once = Once::new();

pub fn setup() {
  INIT.call_once(|| {
    // cargo 注入的库路径会让 ld.so 探测大量目录，影响文件白名单测试
    env::remove_var("LD_LIBRARY_PATH");

    Logger::try_with_str("runbox=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}
