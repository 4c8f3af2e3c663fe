//! System BUID and pairing records stored by usbmuxd

use log::debug;

use super::{protocol::Operation, UsbmuxdContext};
use crate::UsbmuxdError;

impl UsbmuxdContext {
    /// Reads the daemon's system BUID.
    pub async fn read_buid(&self) -> Result<String, UsbmuxdError> {
        let (mut conn, reply) = self.request(&Operation::ReadBuid).await?;
        conn.close().await;

        let dict = reply.into_plist()?;
        dict.get("BUID")
            .and_then(|b| b.as_string())
            .map(str::to_string)
            .ok_or_else(|| UsbmuxdError::Decode("ReadBUID reply has no BUID".into()))
    }

    /// Reads the pairing record stored under `record_id`, usually a UDID.
    pub async fn read_pair_record(&self, record_id: &str) -> Result<Vec<u8>, UsbmuxdError> {
        let (mut conn, reply) = self
            .request(&Operation::ReadPairRecord { record_id })
            .await?;
        conn.close().await;

        let dict = reply.into_plist()?;
        let data = dict
            .get("PairRecordData")
            .and_then(|d| d.as_data())
            .ok_or_else(|| {
                UsbmuxdError::Decode("ReadPairRecord reply has no PairRecordData".into())
            })?;
        debug!("Read {} byte pairing record for {record_id}", data.len());
        Ok(data.to_vec())
    }

    pub async fn save_pair_record(&self, record_id: &str, data: &[u8]) -> Result<(), UsbmuxdError> {
        self.save_pair_record_with_device(record_id, 0, data).await
    }

    /// Stores a pairing record. A `device_id` of 0 ties it to no particular device.
    pub async fn save_pair_record_with_device(
        &self,
        record_id: &str,
        device_id: u32,
        data: &[u8],
    ) -> Result<(), UsbmuxdError> {
        let (mut conn, reply) = self
            .request(&Operation::SavePairRecord {
                record_id,
                device_id,
                data,
            })
            .await?;
        conn.close().await;
        reply.into_ack()
    }

    pub async fn delete_pair_record(&self, record_id: &str) -> Result<(), UsbmuxdError> {
        let (mut conn, reply) = self
            .request(&Operation::DeletePairRecord { record_id })
            .await?;
        conn.close().await;
        reply.into_ack()
    }
}
