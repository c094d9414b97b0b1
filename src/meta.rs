//! Meta subtest: ships the configured metadata to the server's logs.

use crate::client::{Client, NdtConn};
use crate::codec::MsgType;
use crate::error::Result;

pub(crate) async fn run(client: &mut Client, ctl: &mut NdtConn) -> Result<()> {
    ctl.msg_expect_empty(MsgType::TestPrepare).await?;
    ctl.msg_expect_empty(MsgType::TestStart).await?;
    let entries: Vec<(String, String)> = client
        .settings
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, value) in entries {
        ctl.msg_write(MsgType::TestMsg, &format!("{key}:{value}"))
            .await?;
    }
    // An empty TEST_MSG closes the metadata phase.
    ctl.msg_write(MsgType::TestMsg, "").await?;
    ctl.msg_expect_empty(MsgType::TestFinalize).await?;
    Ok(())
}
