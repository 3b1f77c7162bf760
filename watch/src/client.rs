use crate::aggregation::{RewardsRequest, ValidatorRewards};
use crate::server::MissingData;
use crate::types::BlockRewardRecord;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

#[derive(Debug)]
pub enum Error {
    Reqwest(reqwest::Error),
    Url(url::ParseError),
    /// The server refused the request, with the message it gave.
    Server { status: StatusCode, message: String },
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Reqwest(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Url(e)
    }
}

pub struct WatchHttpClient {
    pub client: Client,
    pub server: Url,
}

impl WatchHttpClient {
    async fn get_opt<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, Error> {
        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else {
            response
                .error_for_status()?
                .json()
                .await
                .map_err(Into::into)
        }
    }

    pub async fn get_block_reward(&self, slot: u64) -> Result<Option<BlockRewardRecord>, Error> {
        let url = self
            .server
            .join("v1/")?
            .join("block_rewards/")?
            .join(&slot.to_string())?;

        self.get_opt(url).await
    }

    pub async fn get_missing_data(&self) -> Result<Vec<MissingData>, Error> {
        let url = self.server.join("v1/")?.join("missing_data")?;

        Ok(self.get_opt(url).await?.unwrap_or_default())
    }

    pub async fn post_rewards(
        &self,
        request: &RewardsRequest,
    ) -> Result<Vec<ValidatorRewards>, Error> {
        let url = self.server.join("v2/")?.join("rewards")?;
        let response = self.client.post(url).json(request).send().await?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(Into::into);
        }
        let body: serde_json::Value = response.json().await?;
        Err(Error::Server {
            status,
            message: body["error"].as_str().unwrap_or_default().to_string(),
        })
    }
}
