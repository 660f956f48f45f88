//! AWS backend
//!
//! Route tables are driven through the `aws ec2` command line with JSON
//! output, so credentials, profiles and request signing stay with the tool
//! the operator already configured. Instance identity comes from the link
//! local metadata service.

use crate::cloud::{
    CloudRoute, Destination, InstanceMetadata, MetadataProvider, RouteRequest, RouteTableBackend,
    RouteTableSnapshot, RouteTarget,
};
use crate::error::{LinkError, LinkResult};
use crate::host::run_cmd;
use serde::Deserialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeRouteTables {
    #[serde(default)]
    route_tables: Vec<RouteTableJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RouteTableJson {
    route_table_id: String,
    #[serde(default)]
    routes: Vec<RouteJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RouteJson {
    destination_cidr_block: Option<String>,
    destination_ipv6_cidr_block: Option<String>,
    instance_id: Option<String>,
    network_interface_id: Option<String>,
}

/// Decode `aws ec2 describe-route-tables` output
pub fn parse_route_tables(json: &str) -> LinkResult<RouteTableSnapshot> {
    let resp: DescribeRouteTables = serde_json::from_str(json)
        .map_err(|e| LinkError::parse("cloud: Failed to parse VPC route tables", e))?;

    Ok(resp
        .route_tables
        .into_iter()
        .map(|table| {
            let routes = table
                .routes
                .into_iter()
                .map(|r| CloudRoute {
                    destination_cidr_block: r.destination_cidr_block,
                    destination_ipv6_cidr_block: r.destination_ipv6_cidr_block,
                    instance_id: r.instance_id,
                    network_interface_id: r.network_interface_id,
                })
                .collect();
            (table.route_table_id, routes)
        })
        .collect())
}

fn destination_args(destination: &Destination) -> [String; 2] {
    match destination {
        Destination::V4(net) => ["--destination-cidr-block".into(), net.clone()],
        Destination::V6(net) => ["--destination-ipv6-cidr-block".into(), net.clone()],
    }
}

fn target_args(target: &RouteTarget) -> [String; 2] {
    match target {
        RouteTarget::Instance(id) => ["--instance-id".into(), id.clone()],
        RouteTarget::Interface(id) => ["--network-interface-id".into(), id.clone()],
    }
}

/// `aws ec2` command line backend
#[derive(Debug, Clone, Default)]
pub struct AwsCli {
    profile: Option<String>,
}

impl AwsCli {
    /// Backend using the default credential chain, or a named profile
    pub fn new(profile: &str) -> Self {
        Self {
            profile: (!profile.is_empty()).then(|| profile.to_string()),
        }
    }

    fn base_args(&self, action: &str, region: &str) -> Vec<String> {
        let mut args = vec!["ec2".to_string(), action.to_string()];
        if !region.is_empty() {
            args.extend(["--region".to_string(), region.to_string()]);
        }
        if let Some(profile) = &self.profile {
            args.extend(["--profile".to_string(), profile.clone()]);
        }
        args.extend(["--output".to_string(), "json".to_string()]);
        args
    }

    /// Arguments for a describe-route-tables call
    pub fn describe_args(&self, region: &str, vpc_id: &str) -> Vec<String> {
        let mut args = self.base_args("describe-route-tables", region);
        args.extend([
            "--filters".to_string(),
            format!("Name=vpc-id,Values={}", vpc_id),
        ]);
        args
    }

    /// Arguments for a create-route or replace-route call
    pub fn mutate_args(
        &self,
        action: &str,
        region: &str,
        request: &RouteRequest<'_>,
    ) -> Vec<String> {
        let mut args = self.base_args(action, region);
        args.extend(["--route-table-id".to_string(), request.table_id.to_string()]);
        args.extend(destination_args(request.destination));
        args.extend(target_args(request.target));
        args
    }

    /// Arguments for a delete-route call
    pub fn delete_args(
        &self,
        region: &str,
        table_id: &str,
        destination: &Destination,
    ) -> Vec<String> {
        let mut args = self.base_args("delete-route", region);
        args.extend(["--route-table-id".to_string(), table_id.to_string()]);
        args.extend(destination_args(destination));
        args
    }

    fn run(&self, args: &[String]) -> Result<String, LinkError> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_cmd("aws", &args)
    }
}

impl RouteTableBackend for AwsCli {
    fn route_tables(&self, region: &str, vpc_id: &str) -> LinkResult<RouteTableSnapshot> {
        let out = self
            .run(&self.describe_args(region, vpc_id))
            .map_err(|e| LinkError::request("cloud: Failed to get VPC route tables", e))?;
        parse_route_tables(&out)
    }

    fn create_route(&self, region: &str, request: &RouteRequest<'_>) -> LinkResult<()> {
        self.run(&self.mutate_args("create-route", region, request))
            .map_err(|e| LinkError::request("cloud: Failed to create route", e))?;
        Ok(())
    }

    fn replace_route(&self, region: &str, request: &RouteRequest<'_>) -> LinkResult<()> {
        self.run(&self.mutate_args("replace-route", region, request))
            .map_err(|e| LinkError::request("cloud: Failed to replace route", e))?;
        Ok(())
    }

    fn delete_route(
        &self,
        region: &str,
        table_id: &str,
        destination: &Destination,
    ) -> LinkResult<()> {
        self.run(&self.delete_args(region, table_id, destination))
            .map_err(|e| LinkError::request("cloud: Failed to delete route", e))?;
        Ok(())
    }
}

/// Instance metadata service client over plain HTTP
#[derive(Debug, Clone)]
pub struct Imds {
    addr: SocketAddr,
    timeout: Duration,
}

impl Default for Imds {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([169, 254, 169, 254], 80)),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Split a raw HTTP/1.x response into status code and body
pub fn parse_http_response(raw: &[u8]) -> LinkResult<(u16, String)> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| LinkError::parse("cloud: Malformed metadata response", "no header end"))?;

    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| LinkError::parse("cloud: Malformed metadata response", "bad status line"))?;

    Ok((status, body.trim().to_string()))
}

impl Imds {
    /// Client for a custom endpoint
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
    ) -> LinkResult<(u16, String)> {
        let mut stream = TcpStream::connect_timeout(&self.addr, self.timeout)
            .map_err(|e| LinkError::request("cloud: Failed to reach metadata service", e))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| LinkError::request("cloud: Failed to set metadata timeout", e))?;

        let mut req = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: 0\r\n",
            method,
            path,
            self.addr.ip()
        );
        for (name, value) in headers {
            req.push_str(&format!("{}: {}\r\n", name, value));
        }
        req.push_str("\r\n");

        stream
            .write_all(req.as_bytes())
            .map_err(|e| LinkError::request("cloud: Failed to send metadata request", e))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .map_err(|e| LinkError::request("cloud: Failed to read metadata response", e))?;

        parse_http_response(&raw)
    }

    fn token(&self) -> Option<String> {
        match self.request(
            "PUT",
            "/latest/api/token",
            &[("X-aws-ec2-metadata-token-ttl-seconds", "60")],
        ) {
            Ok((200, token)) if !token.is_empty() => Some(token),
            Ok((status, _)) => {
                tracing::debug!("Metadata token request returned {}", status);
                None
            }
            Err(e) => {
                tracing::debug!("Metadata token request failed: {}", e);
                None
            }
        }
    }

    fn get(&self, token: Option<&str>, key: &str, what: &str) -> LinkResult<String> {
        let path = format!("/latest/meta-data/{}", key);
        let headers: Vec<(&str, &str)> = token
            .map(|t| vec![("X-aws-ec2-metadata-token", t)])
            .unwrap_or_default();

        match self.request("GET", &path, &headers)? {
            (200, body) => Ok(body),
            (status, _) => Err(LinkError::request(
                &format!("cloud: Failed to get EC2 {}", what),
                format!("HTTP {}", status),
            )),
        }
    }
}

impl MetadataProvider for Imds {
    fn instance_metadata(&self) -> LinkResult<InstanceMetadata> {
        let token = self.token();
        let token = token.as_deref();

        let region = self.get(token, "placement/region", "region")?;
        let instance_id = self.get(token, "instance-id", "instance ID")?;
        let mac_address = self.get(token, "mac", "MAC address")?;
        let vpc_id = self.get(
            token,
            &format!("network/interfaces/macs/{}/vpc-id", mac_address),
            "VPC ID",
        )?;

        Ok(InstanceMetadata {
            region,
            instance_id,
            mac_address,
            vpc_id,
        })
    }
}
